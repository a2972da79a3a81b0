//! x64 page table attribute management for a System Management Mode environment.
//!
//! The crate walks an existing 4-level, identity mapped page table, splits 1GB and 2MB pages on demand and
//! toggles the present, read/write and no-execute bits of every entry covering a requested range. After a
//! range has been changed, the TLBs of every logical processor are flushed before the call returns.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod arch;
pub mod context;
pub mod page_allocator;
pub mod paging;
pub mod structs;
pub mod tlb;
pub mod x64;

use core::fmt::{self, Display, Formatter};

use bitflags::bitflags;

pub use arch::{ApProcedure, MpServices, SmmCpuHal};
pub use context::{CpuCapabilities, PageTableBase, PageTableContext};
pub use page_allocator::PageAllocator;
pub use paging::{RangeConversion, SmmPageTable};
pub use structs::{PageAttribute, PhysicalAddress};
pub use x64::{attributes_from_page_entry, build_identity_page_table, PageTableEntry, X64SmmCpu, X64SmmPageTable};

pub type PtResult<T> = Result<T, PtError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PtError {
    // Invalid parameter
    InvalidParameter,

    // Out of resources
    OutOfResources,

    // The page table does not describe the address, or the requested split is not possible
    Unsupported,

    // Attributes differ across the queried range
    NonUniformMemoryAttributes,

    // Unaligned Page Base
    UnalignedPageBase,

    // Unaligned Address
    UnalignedAddress,

    // Unaligned Memory Range
    UnalignedMemoryRange,

    // Invalid Memory Range
    InvalidMemoryRange,

    // Overflow during address calculation
    AdditionOverflow,
}

impl PtError {
    /// Returns true for errors raised purely from caller supplied values, before the page table is touched.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(
            self,
            PtError::InvalidParameter
                | PtError::UnalignedPageBase
                | PtError::UnalignedAddress
                | PtError::UnalignedMemoryRange
                | PtError::InvalidMemoryRange
        )
    }
}

impl Display for PtError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let text = match self {
            PtError::InvalidParameter => "invalid parameter",
            PtError::OutOfResources => "out of page table memory",
            PtError::Unsupported => "unsupported",
            PtError::NonUniformMemoryAttributes => "memory attributes are not uniform across the range",
            PtError::UnalignedPageBase => "page table base is not page aligned",
            PtError::UnalignedAddress => "address is not page aligned",
            PtError::UnalignedMemoryRange => "length is not page aligned",
            PtError::InvalidMemoryRange => "invalid memory range",
            PtError::AdditionOverflow => "address overflow",
        };
        f.write_str(text)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct MemoryAttributes: u64 {
        const ReadProtect       = 0x00000000_00002000u64;   // Maps to Present bit on X64
        const ExecuteProtect    = 0x00000000_00004000u64;   // Maps to NX bit on X64
        const ReadOnly          = 0x00000000_00020000u64;   // Maps to Read/Write bit on X64

        const AccessAttributesMask = Self::ReadProtect.bits() |
                                    Self::ExecuteProtect.bits() |
                                    Self::ReadOnly.bits();
    }
}

/// The memory attribute surface exposed to the rest of the SMM environment.
pub trait SmmMemoryAttribute {
    /// Set the given attributes on the memory region, marking the pages not present, read-only or
    /// non-executable.
    ///
    /// ## Arguments
    /// * `base_address` - Start of the region. Must be 4KB aligned.
    /// * `length` - Size of the region. Must be non-zero and 4KB aligned.
    /// * `attributes` - Any combination of ReadProtect, ReadOnly and ExecuteProtect.
    ///
    /// ## Errors
    /// * Returns `Ok(())` if successful else `Err(PtError)` if failed
    fn set_memory_attributes(&mut self, base_address: u64, length: u64, attributes: MemoryAttributes) -> PtResult<()>;

    /// Clear the given attributes on the memory region, restoring present, writable or executable pages.
    ///
    /// ## Arguments
    /// * `base_address` - Start of the region. Must be 4KB aligned.
    /// * `length` - Size of the region. Must be non-zero and 4KB aligned.
    /// * `attributes` - Any combination of ReadProtect, ReadOnly and ExecuteProtect.
    ///
    /// ## Errors
    /// * Returns `Ok(())` if successful else `Err(PtError)` if failed
    fn clear_memory_attributes(&mut self, base_address: u64, length: u64, attributes: MemoryAttributes)
    -> PtResult<()>;

    /// Query the attributes of the memory region. Every page in the region must report the same
    /// attributes.
    ///
    /// ## Errors
    /// * `PtError::NonUniformMemoryAttributes` if the attributes differ across the region.
    /// * `PtError::Unsupported` if part of the region is not described by the page table.
    fn get_memory_attributes(&self, base_address: u64, length: u64) -> PtResult<MemoryAttributes>;
}

#[cfg(test)]
mod tests;
