//! Applying memory attributes to a single entry.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use super::structs::PageTableEntry;
use crate::{context::PageTableContext, MemoryAttributes};

/// Set (`is_set`) or clear the requested attributes on `entry`. Returns true if the entry changed.
///
/// ReadOnly is special. When the context refers to an internal table the page becomes a supervisor shadow stack
/// page, which needs the dirty bit set and the user bit clear. On the active table the dirty bit is cleared
/// instead so the first write faults. ExecuteProtect is ignored when the processor does not support NX.
pub(crate) fn convert_page_entry_attribute(
    entry: &mut PageTableEntry,
    attributes: MemoryAttributes,
    is_set: bool,
    ctx: &PageTableContext,
) -> bool {
    let current = entry.read();
    let mut new_entry = current;

    if attributes.contains(MemoryAttributes::ReadProtect) {
        new_entry.set_present(!is_set);
    }

    if attributes.contains(MemoryAttributes::ReadOnly) {
        if is_set {
            new_entry.set_read_write(false);
            if ctx.is_internal() {
                new_entry.set_dirty(true);
                new_entry.set_user_supervisor(false);
            } else {
                new_entry.set_dirty(false);
            }
        } else {
            new_entry.set_read_write(true);
        }
    }

    if attributes.contains(MemoryAttributes::ExecuteProtect) && ctx.capabilities().nx_supported {
        new_entry.set_nx(is_set);
    }

    if new_entry == current {
        return false;
    }

    entry.swap(&new_entry);
    log::trace!("Convert page entry {:#x} -> {:#x}", current.into_bits(), new_entry.into_bits());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::CpuCapabilities,
        x64::structs::{IA32_PG_D, IA32_PG_NX, IA32_PG_P, IA32_PG_RW, IA32_PG_U, PAGE_ATTRIBUTE_BITS},
    };

    const FRAME: u64 = 0x7654_3000;

    fn active() -> PageTableContext {
        PageTableContext::active(CpuCapabilities::default())
    }

    #[test]
    fn test_read_protect_toggles_present() {
        let mut entry = PageTableEntry::from_bits(FRAME | PAGE_ATTRIBUTE_BITS);
        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadProtect, true, &active()));
        assert_eq!(entry.raw(), FRAME | (PAGE_ATTRIBUTE_BITS & !IA32_PG_P));

        assert!(!convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadProtect, true, &active()));

        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadProtect, false, &active()));
        assert_eq!(entry.raw(), FRAME | PAGE_ATTRIBUTE_BITS);
    }

    #[test]
    fn test_read_only_on_active_table_clears_dirty() {
        let mut entry = PageTableEntry::from_bits(FRAME | PAGE_ATTRIBUTE_BITS);
        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadOnly, true, &active()));
        assert_eq!(entry.raw(), FRAME | (PAGE_ATTRIBUTE_BITS & !(IA32_PG_RW | IA32_PG_D)));

        // Clearing read-only does not restore the dirty bit.
        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadOnly, false, &active()));
        assert_eq!(entry.raw(), FRAME | (PAGE_ATTRIBUTE_BITS & !IA32_PG_D));
    }

    #[test]
    fn test_read_only_on_internal_table_marks_shadow_stack() {
        let ctx = unsafe { PageTableContext::internal(0x1000, CpuCapabilities::default()).unwrap() };
        let mut entry = PageTableEntry::from_bits(FRAME | IA32_PG_U | IA32_PG_RW | IA32_PG_P);
        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ReadOnly, true, &ctx));
        assert_eq!(entry.raw(), FRAME | IA32_PG_D | IA32_PG_P);
    }

    #[test]
    fn test_execute_protect() {
        let mut entry = PageTableEntry::from_bits(FRAME | PAGE_ATTRIBUTE_BITS);
        assert!(convert_page_entry_attribute(&mut entry, MemoryAttributes::ExecuteProtect, true, &active()));
        assert_eq!(entry.raw(), FRAME | PAGE_ATTRIBUTE_BITS | IA32_PG_NX);

        let no_nx = PageTableContext::active(CpuCapabilities::default().with_nx(false));
        assert!(!convert_page_entry_attribute(&mut entry, MemoryAttributes::ExecuteProtect, false, &no_nx));
        assert_eq!(entry.raw(), FRAME | PAGE_ATTRIBUTE_BITS | IA32_PG_NX);
    }

    #[test]
    fn test_combined_attributes() {
        let mut entry = PageTableEntry::from_bits(FRAME | PAGE_ATTRIBUTE_BITS);
        let all = MemoryAttributes::AccessAttributesMask;
        assert!(convert_page_entry_attribute(&mut entry, all, true, &active()));
        assert_eq!(entry.get_attributes(), all);
        assert!(convert_page_entry_attribute(&mut entry, all, false, &active()));
        assert_eq!(entry.get_attributes(), MemoryAttributes::empty());
    }
}
