//! Building the identity mapped page table used in SMM.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ptr;

use super::{
    structs::{PageTableEntry, IA32_PG_PS, PAGE_ATTRIBUTE_BITS},
    walker::get_table,
};
use crate::{
    context::{CpuCapabilities, MAX_PHYSICAL_ADDRESS_BITS},
    page_allocator::PageAllocator,
    structs::{PageLevel, PhysicalAddress, MAX_ENTRIES, PAGE_SIZE, SIZE_1GB, SIZE_2MB},
    PtError, PtResult,
};

/// Number of 1GB slots below 4GB, always mapped with 2MB pages.
const GIGABYTES_BELOW_4GB: u64 = 4;

/// Allocate and zero one page table.
fn allocate_table<P: PageAllocator>(page_allocator: &mut P) -> PtResult<PhysicalAddress> {
    let base = page_allocator.allocate_page(PAGE_SIZE, PAGE_SIZE).map_err(|err| {
        log::error!("Failed to allocate a page table: {:?}", err);
        PtError::OutOfResources
    })?;

    let base = PhysicalAddress::new(base);
    if !base.is_page_aligned() {
        log::error!("Page table allocation {} is not page aligned", base);
        return Err(PtError::UnalignedPageBase);
    }

    // SAFETY: the allocator handed out an identity mapped page that nothing references yet
    unsafe { ptr::write_bytes(u64::from(base) as *mut u8, 0, PAGE_SIZE as usize) };
    Ok(base)
}

fn table_pointer(table: PhysicalAddress, address_enc_mask: u64) -> PageTableEntry {
    PageTableEntry::from_bits(u64::from(table) | address_enc_mask | PAGE_ATTRIBUTE_BITS)
}

fn large_page(address: u64, address_enc_mask: u64) -> PageTableEntry {
    PageTableEntry::from_bits(address | address_enc_mask | IA32_PG_PS | PAGE_ATTRIBUTE_BITS)
}

/// Allocate a page directory mapping the 1GB at `address` with 2MB pages.
fn build_page_directory<P: PageAllocator>(
    page_allocator: &mut P,
    address: u64,
    address_enc_mask: u64,
) -> PtResult<PhysicalAddress> {
    let directory = allocate_table(page_allocator)?;
    // SAFETY: freshly allocated table
    let entries = unsafe { get_table(directory) };
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.swap(&large_page(address + SIZE_2MB * index as u64, address_enc_mask));
    }
    Ok(directory)
}

/// Build an identity mapped 4-level page table covering the physical address space of the processor and return
/// the address of its level 4 table.
///
/// The first 4GB is mapped with 2MB pages. The rest is mapped with 1GB pages when the processor supports them and
/// with 2MB pages otherwise. Every entry is present, writable and executable, and carries the encryption mask.
pub fn build_identity_page_table<P: PageAllocator>(
    page_allocator: &mut P,
    capabilities: &CpuCapabilities,
) -> PtResult<PhysicalAddress> {
    capabilities.validate()?;
    let enc = capabilities.address_enc_mask;
    let bits = capabilities.physical_address_bits.min(MAX_PHYSICAL_ADDRESS_BITS);

    let (pml4_entries, pdp_entries) = if bits <= 39 {
        (1usize, 1usize << (bits - 30))
    } else {
        (1usize << (bits - 39), MAX_ENTRIES)
    };

    let pml4 = allocate_table(page_allocator)?;
    // SAFETY: freshly allocated table, owned by this function until it returns
    let pml4_table = unsafe { get_table(pml4) };

    for (pml4_index, pml4_entry) in pml4_table.iter_mut().enumerate().take(pml4_entries) {
        let pdpt = allocate_table(page_allocator)?;
        // SAFETY: freshly allocated table
        let pdp_table = unsafe { get_table(pdpt) };

        for (pdp_index, pdp_entry) in pdp_table.iter_mut().enumerate().take(pdp_entries) {
            let address = ((pml4_index as u64) << PageLevel::Level4.start_bit()) + SIZE_1GB * pdp_index as u64;
            if capabilities.page_1g_supported && address >= GIGABYTES_BELOW_4GB * SIZE_1GB {
                pdp_entry.swap(&large_page(address, enc));
            } else {
                let directory = build_page_directory(page_allocator, address, enc)?;
                pdp_entry.swap(&table_pointer(directory, enc));
            }
        }

        pml4_entry.swap(&table_pointer(pdpt, enc));
    }

    log::info!(
        "Built identity page table at {} covering {} physical address bits{}",
        pml4,
        bits,
        if capabilities.page_1g_supported { " with 1GB pages" } else { "" }
    );
    Ok(pml4)
}
