//! Common data structures and constants for page table walking and splitting.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{
    fmt::{self, Display, Formatter},
    ops::Add,
};

use crate::{PtError, PtResult};

// Constants for common sizes.
pub const SIZE_4KB: u64 = 0x1000;
pub const SIZE_2MB: u64 = 0x200000;
pub const SIZE_1GB: u64 = 0x40000000;
pub const SIZE_4GB: u64 = 0x100000000;
pub const SIZE_512GB: u64 = 0x8000000000;

/// Size of a page in bytes. Page tables themselves are always one 4KB page.
pub const PAGE_SIZE: u64 = SIZE_4KB;

/// Page index mask for 4KB pages with 64-bit page table entries.
const PAGE_INDEX_MASK: u64 = 0x1FF;

/// Number of entries in one page table.
pub const MAX_ENTRIES: usize = (PAGE_SIZE / 8) as usize;

#[derive(PartialEq, Clone, Copy, Debug, Eq, Hash)]
pub enum PageLevel {
    Level4,
    Level3,
    Level2,
    Level1,
}

impl PageLevel {
    pub fn next_level(&self) -> Option<PageLevel> {
        match self {
            PageLevel::Level4 => Some(PageLevel::Level3),
            PageLevel::Level3 => Some(PageLevel::Level2),
            PageLevel::Level2 => Some(PageLevel::Level1),
            PageLevel::Level1 => None,
        }
    }

    pub fn start_bit(&self) -> u64 {
        match self {
            PageLevel::Level4 => 39,
            PageLevel::Level3 => 30,
            PageLevel::Level2 => 21,
            PageLevel::Level1 => 12,
        }
    }

    pub fn entry_size(&self) -> u64 {
        1 << self.start_bit()
    }

    /// The granularity an entry at this level maps when it is a leaf. Level 4 entries never map memory directly.
    pub fn leaf_attribute(&self) -> Option<PageAttribute> {
        match self {
            PageLevel::Level4 => None,
            PageLevel::Level3 => Some(PageAttribute::Page1G),
            PageLevel::Level2 => Some(PageAttribute::Page2M),
            PageLevel::Level1 => Some(PageAttribute::Page4K),
        }
    }
}

/// Granularity at which an address is currently mapped.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub enum PageAttribute {
    Page4K,
    Page2M,
    Page1G,
}

struct PageAttributeDescriptor {
    length: u64,
    address_mask: u64,
}

// Indexed by `PageAttribute as usize`.
const PAGE_ATTRIBUTE_TABLE: [PageAttributeDescriptor; 3] = [
    PageAttributeDescriptor { length: SIZE_4KB, address_mask: 0x000f_ffff_ffff_f000 },
    PageAttributeDescriptor { length: SIZE_2MB, address_mask: 0x000f_ffff_ffe0_0000 },
    PageAttributeDescriptor { length: SIZE_1GB, address_mask: 0x000f_ffff_c000_0000 },
];

impl PageAttribute {
    /// Number of bytes mapped by one entry of this granularity.
    pub const fn length(&self) -> u64 {
        PAGE_ATTRIBUTE_TABLE[*self as usize].length
    }

    /// Mask selecting the frame address bits of an entry of this granularity.
    pub const fn address_mask(&self) -> u64 {
        PAGE_ATTRIBUTE_TABLE[*self as usize].address_mask
    }

    /// The table level holding leaf entries of this granularity.
    pub fn level(&self) -> PageLevel {
        match self {
            PageAttribute::Page4K => PageLevel::Level1,
            PageAttribute::Page2M => PageLevel::Level2,
            PageAttribute::Page1G => PageLevel::Level3,
        }
    }

    /// The next smaller granularity, if any.
    pub fn smaller(&self) -> Option<PageAttribute> {
        match self {
            PageAttribute::Page4K => None,
            PageAttribute::Page2M => Some(PageAttribute::Page4K),
            PageAttribute::Page1G => Some(PageAttribute::Page2M),
        }
    }
}

impl Display for PageAttribute {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let name = match self {
            PageAttribute::Page4K => "4KB",
            PageAttribute::Page2M => "2MB",
            PageAttribute::Page1G => "1GB",
        };
        fmt.pad(name)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct PhysicalAddress(u64);
impl PhysicalAddress {
    pub fn new(pa: u64) -> Self {
        Self(pa)
    }

    /// This will return the table index of the address at the given level.
    pub fn get_index(&self, level: PageLevel) -> u64 {
        (self.0 >> level.start_bit()) & PAGE_INDEX_MASK
    }

    pub fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// `alignment` must be a power of two.
    pub fn is_aligned(&self, alignment: u64) -> bool {
        (self.0 & (alignment - 1)) == 0
    }

    /// Rounds the address down to the start of the page of the given granularity.
    pub fn align_down(&self, granularity: PageAttribute) -> PhysicalAddress {
        PhysicalAddress(self.0 & !(granularity.length() - 1))
    }
}

impl From<u64> for PhysicalAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<PhysicalAddress> for u64 {
    fn from(addr: PhysicalAddress) -> Self {
        addr.0
    }
}

impl Display for PhysicalAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = PtResult<Self>;

    fn add(self, rhs: u64) -> Self::Output {
        match self.0.checked_add(rhs) {
            Some(result) => Ok(PhysicalAddress(result)),
            None => Err(PtError::AdditionOverflow),
        }
    }
}
