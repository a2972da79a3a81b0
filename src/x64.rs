//! x64 implementation of the SMM page table engine: entry layout, walking, splitting and attribute conversion.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#[allow(unused_imports)]
use core::arch::asm;

mod builder;
mod convert;
mod split;
pub mod structs;
mod walker;

pub use builder::build_identity_page_table;
pub(crate) use convert::convert_page_entry_attribute;
pub(crate) use split::split_page;
pub use structs::{attributes_from_page_entry, PageTableEntry};
pub(crate) use walker::get_page_table_entry;

use crate::{arch::SmmCpuHal, paging::SmmPageTable};

/// The SMM page table on real x64 hardware.
pub type X64SmmPageTable<P, M> = SmmPageTable<P, M, X64SmmCpu>;

/// Processor primitives of the executing x64 processor.
pub struct X64SmmCpu;

impl SmmCpuHal for X64SmmCpu {
    fn read_cr3() -> u64 {
        let mut _value = 0u64;

        #[cfg(all(not(test), target_arch = "x86_64"))]
        {
            // SAFETY: inline asm is inherently unsafe because Rust can't reason about it.
            // In this case we are reading the CR3 register, which is a safe operation.
            unsafe {
                asm!("mov {}, cr3", out(reg) _value, options(nostack, preserves_flags));
            }
        }

        _value
    }

    fn flush_tlb() {
        // Reloading CR3 drops every non-global translation of this processor.
        #[cfg(all(not(test), target_arch = "x86_64"))]
        {
            // SAFETY: CR3 is written back with the value it already holds.
            unsafe {
                asm!(
                    "mov {tmp}, cr3",
                    "mov cr3, {tmp}",
                    tmp = out(reg) _,
                    options(nostack, preserves_flags)
                );
            }
        }
    }
}
