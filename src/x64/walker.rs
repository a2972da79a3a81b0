//! Locating the entry that maps an address.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::slice;

use super::structs::PageTableEntry;
use crate::{
    arch::SmmCpuHal,
    context::PageTableContext,
    structs::{PageAttribute, PageLevel, PhysicalAddress, MAX_ENTRIES},
};

/// View the page table at `base` as its 512 entries.
///
/// # Safety
///
/// `base` must be the identity mapped address of a page table that stays valid for `'a`, and no other reference to
/// the same table may be alive at the same time.
pub(crate) unsafe fn get_table<'a>(base: PhysicalAddress) -> &'a mut [PageTableEntry] {
    let base: u64 = base.into();
    unsafe { slice::from_raw_parts_mut(base as *mut PageTableEntry, MAX_ENTRIES) }
}

/// Walk the page table selected by `ctx` and return the entry mapping `address` with its granularity. Large page
/// entries at level 3 and 2 are returned directly.
///
/// Returns `None` when the address falls into a hole, that is an intermediate entry or the final level 1 entry is
/// zero. Address 0 is the exception: a zero level 1 entry for it is reported as a mapped 4KB page.
///
/// # Safety
///
/// The context must refer to a valid page table whose tables are all identity mapped.
pub(crate) unsafe fn get_page_table_entry<'a, Arch: SmmCpuHal>(
    ctx: &PageTableContext,
    address: PhysicalAddress,
) -> Option<(&'a mut PageTableEntry, PageAttribute)> {
    let enc_mask = ctx.address_enc_mask();
    let mut table = ctx.resolve_base::<Arch>();
    let mut level = PageLevel::Level4;

    loop {
        let index = address.get_index(level) as usize;
        // SAFETY: the table comes from CR3, the context or a present entry of the parent table
        let entry = unsafe { &mut get_table(table)[index] };

        if level == PageLevel::Level1 {
            if entry.is_zero() && u64::from(address) != 0 {
                return None;
            }
            return Some((entry, PageAttribute::Page4K));
        }

        if entry.is_zero() {
            return None;
        }

        // PS is reserved at level 4, so only level 3 and 2 report a large page.
        if let (true, Some(attribute)) = (entry.read().page_size(), level.leaf_attribute()) {
            return Some((entry, attribute));
        }

        table = entry.next_table_address(enc_mask);
        level = level.next_level()?;
    }
}
