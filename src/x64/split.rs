//! Splitting a large page into a table of smaller pages.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::sync::atomic::{compiler_fence, Ordering};

use super::{
    structs::{PageTableEntry, IA32_PG_PS, PAGE_ATTRIBUTE_BITS, PAGE_PROPAGATE_BITS},
    walker::get_table,
};
use crate::{
    page_allocator::PageAllocator,
    structs::{PageAttribute, PhysicalAddress, PAGE_SIZE},
    PtError, PtResult,
};

/// Replace the large page `entry` of granularity `current` with a pointer to a new table of pages one level
/// smaller, so the range needing `target` granularity can be reached.
///
/// A 2MB page can only be split for 4KB. A 1GB page is split into 2MB pages for both 2MB and 4KB targets; the
/// caller walks again and splits the resulting 2MB page when it needs 4KB.
///
/// Every new entry maps the same memory as the corresponding part of the large page and carries its propagated
/// bits. The large page entry is only overwritten after the new table is complete.
pub(crate) fn split_page<P: PageAllocator>(
    entry: &mut PageTableEntry,
    current: PageAttribute,
    target: PageAttribute,
    page_allocator: &mut P,
    address_enc_mask: u64,
) -> PtResult<()> {
    let child_page_size = match (current, target) {
        (PageAttribute::Page2M, PageAttribute::Page4K) => 0,
        (PageAttribute::Page1G, PageAttribute::Page2M | PageAttribute::Page4K) => IA32_PG_PS,
        _ => {
            log::error!("Cannot split a {} page for {} granularity", current, target);
            return Err(PtError::Unsupported);
        }
    };
    let child = current.smaller().ok_or(PtError::Unsupported)?;

    let new_table = page_allocator.allocate_page(PAGE_SIZE, PAGE_SIZE).map_err(|err| {
        log::error!("Failed to allocate a page table to split a {} page: {:?}", current, err);
        PtError::OutOfResources
    })?;
    if new_table & (PAGE_SIZE - 1) != 0 {
        log::error!("Page table allocation {:#x} is not page aligned", new_table);
        return Err(PtError::UnalignedPageBase);
    }

    let old_entry = entry.read();
    let base: u64 = old_entry.frame_address(current, address_enc_mask).into();
    let propagated = old_entry.into_bits() & PAGE_PROPAGATE_BITS;

    // SAFETY: the allocator returned an identity mapped page that nothing else references yet
    let table = unsafe { get_table(PhysicalAddress::new(new_table)) };
    for (index, child_entry) in table.iter_mut().enumerate() {
        let frame = base + child.length() * index as u64;
        child_entry.swap(&PageTableEntry::from_bits(frame | address_enc_mask | child_page_size | propagated));
    }

    // The new table must be fully written before it becomes reachable.
    compiler_fence(Ordering::Release);
    entry.swap(&PageTableEntry::from_bits(new_table | address_enc_mask | PAGE_ATTRIBUTE_BITS));

    log::trace!(
        "Split {} page at {:#x} into {} pages, new table at {:#x}",
        current,
        base,
        child,
        new_table
    );
    Ok(())
}
