//! x64 page table entry layout.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ptr;

use bitfield_struct::bitfield;

use crate::{
    structs::{PageAttribute, PhysicalAddress},
    MemoryAttributes,
};

pub(crate) const IA32_PG_P: u64 = 1 << 0;
pub(crate) const IA32_PG_RW: u64 = 1 << 1;
pub(crate) const IA32_PG_U: u64 = 1 << 2;
pub(crate) const IA32_PG_WT: u64 = 1 << 3;
pub(crate) const IA32_PG_CD: u64 = 1 << 4;
pub(crate) const IA32_PG_A: u64 = 1 << 5;
pub(crate) const IA32_PG_D: u64 = 1 << 6;
pub(crate) const IA32_PG_PS: u64 = 1 << 7;
pub(crate) const IA32_PG_NX: u64 = 1 << 63;

/// Bits given to every table pointer and every freshly built leaf entry.
pub const PAGE_ATTRIBUTE_BITS: u64 = IA32_PG_D | IA32_PG_A | IA32_PG_U | IA32_PG_RW | IA32_PG_P;

/// Bits copied from a large page into each entry of the table it is split into.
pub const PAGE_PROPAGATE_BITS: u64 =
    IA32_PG_NX | IA32_PG_D | IA32_PG_A | IA32_PG_CD | IA32_PG_WT | IA32_PG_U | IA32_PG_RW | IA32_PG_P;

/// Address bits of a pointer to a next level table.
pub(crate) const PAGING_4K_ADDRESS_MASK_64: u64 = 0x000f_ffff_ffff_f000;

#[rustfmt::skip]
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,                // 1 bit -  0 = Not present in memory, 1 = Present in memory
    pub read_write: bool,             // 1 bit -  0 = Read-Only, 1= Read/Write
    pub user_supervisor: bool,        // 1 bit -  0 = Supervisor, 1=User
    pub write_through: bool,          // 1 bit -  0 = Write-Back caching, 1=Write-Through caching
    pub cache_disabled: bool,         // 1 bit -  0 = Cached, 1=Non-Cached
    pub accessed: bool,               // 1 bit -  0 = Not accessed, 1 = Accessed (set by CPU)
    pub dirty: bool,                  // 1 bit -  0 = Not Dirty, 1 = written by processor on access to page
    pub page_size: bool,              // 1 bit -  1 = 2MB page for PD, 1GB page for PDP, Must be 0 for others.
    pub global: bool,                 // 1 bit -  0 = Not global page, 1 = global page TLB not cleared on CR3 write
    #[bits(3)]
    pub available: u8,                // 3 bits -  Available for use by system software
    #[bits(40)]
    pub page_frame: u64,              // 40 bits -  Frame or next table address, bit 12 is PAT on large pages
    #[bits(11)]
    pub available_high: u16,          // 11 bits -  Available for use by system software
    pub nx: bool,                     // 1 bit -  0 = Execute Code, 1 = No Code Execution
}

impl PageTableEntry {
    /// Read the entry with a single volatile load. The processor and other CPUs may update the accessed and dirty
    /// bits at any time.
    pub fn read(&self) -> PageTableEntry {
        // SAFETY: self is a valid reference to an entry
        unsafe { ptr::read_volatile(self) }
    }

    /// Replace the entry with a single 64-bit volatile store, so a concurrent table walk sees either the old or
    /// the new entry.
    pub fn swap(&mut self, new_entry: &PageTableEntry) {
        // SAFETY: self is a valid mutable reference to an entry
        unsafe { ptr::write_volatile(self, *new_entry) }
    }

    pub fn raw(&self) -> u64 {
        self.read().into_bits()
    }

    /// An entry with no bits set describes nothing, not even a not-present page.
    pub fn is_zero(&self) -> bool {
        self.raw() == 0
    }

    /// Address of the table this entry points to.
    pub fn next_table_address(&self, address_enc_mask: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.raw() & !address_enc_mask & PAGING_4K_ADDRESS_MASK_64)
    }

    /// Address of the frame this leaf entry maps at the given granularity.
    pub fn frame_address(&self, granularity: PageAttribute, address_enc_mask: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.raw() & !address_enc_mask & granularity.address_mask())
    }

    /// Memory attributes described by the entry.
    pub fn get_attributes(&self) -> MemoryAttributes {
        let entry = self.read();
        let mut attributes = MemoryAttributes::empty();

        if !entry.present() {
            attributes |= MemoryAttributes::ReadProtect;
        }

        if !entry.read_write() {
            attributes |= MemoryAttributes::ReadOnly;
        }

        if entry.nx() {
            attributes |= MemoryAttributes::ExecuteProtect;
        }

        attributes
    }
}

/// Memory attributes described by a leaf entry.
pub fn attributes_from_page_entry(entry: &PageTableEntry) -> MemoryAttributes {
    entry.get_attributes()
}
