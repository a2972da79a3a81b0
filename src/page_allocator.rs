//! Page table memory allocation interface.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::PtResult;

/// PageAllocator trait facilitates `allocate_page()` method for allocating new
/// page table pages. Pages handed out are never returned; a page table lives
/// for the lifetime of the SMM environment.
pub trait PageAllocator {
    /// Allocate aligned pages from physical memory.
    ///
    /// ## Arguments
    /// * `align` - on x64 this will be 4KB page alignment.
    /// * `size` - on x64 this will be 4KB page size.
    ///
    /// ## Returns
    /// * `PtResult<u64>` - Physical address of the allocated page. The page is
    ///   identity mapped and its contents are undefined.
    fn allocate_page(&mut self, align: u64, size: u64) -> PtResult<u64>;
}
