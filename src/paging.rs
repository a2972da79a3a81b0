//! The range attribute engine and the SMM memory attribute surface built on it.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::marker::PhantomData;

use crate::{
    arch::{MpServices, SmmCpuHal},
    context::{CpuCapabilities, PageTableContext},
    page_allocator::PageAllocator,
    structs::{PageAttribute, PhysicalAddress, PAGE_SIZE, SIZE_2MB, SIZE_4KB},
    tlb::flush_tlb_for_all,
    x64::{convert_page_entry_attribute, get_page_table_entry, split_page, PageTableEntry, X64SmmCpu},
    MemoryAttributes, PtError, PtResult, SmmMemoryAttribute,
};

/// What a range conversion did to the page table. The values stay meaningful when the conversion fails part way,
/// since entries converted before the failure are not restored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeConversion {
    /// A large page was split.
    pub split: bool,
    /// An entry changed, so TLBs must be flushed.
    pub modified: bool,
}

/// Page table attribute manager for SMM.
pub struct SmmPageTable<P: PageAllocator, M: MpServices, Arch: SmmCpuHal = X64SmmCpu> {
    page_allocator: P,
    mp_services: M,
    capabilities: CpuCapabilities,
    _arch: PhantomData<Arch>,
}

impl<P: PageAllocator, M: MpServices, Arch: SmmCpuHal> SmmPageTable<P, M, Arch> {
    /// Create the attribute manager.
    ///
    /// # Safety
    ///
    /// Whenever an operation runs on the active page table, CR3 must hold the address of a valid, identity mapped
    /// 4-level page table that only this manager modifies. `page_allocator` must hand out identity mapped pages.
    pub unsafe fn new(page_allocator: P, mp_services: M, capabilities: CpuCapabilities) -> PtResult<Self> {
        capabilities.validate()?;
        Ok(Self { page_allocator, mp_services, capabilities, _arch: PhantomData })
    }

    pub fn capabilities(&self) -> &CpuCapabilities {
        &self.capabilities
    }

    /// Context for the page table installed in CR3.
    pub fn active_context(&self) -> PageTableContext {
        PageTableContext::active(self.capabilities)
    }

    fn validate_range(
        ctx: &PageTableContext,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
    ) -> PtResult<()> {
        if length == 0 {
            log::error!("Memory range at {:#x} is empty", base_address);
            return Err(PtError::InvalidMemoryRange);
        }

        if !PhysicalAddress::new(base_address).is_page_aligned() {
            log::error!("Base address {:#x} is not page aligned", base_address);
            return Err(PtError::UnalignedAddress);
        }

        if length & (PAGE_SIZE - 1) != 0 {
            log::error!("Length {:#x} is not page aligned", length);
            return Err(PtError::UnalignedMemoryRange);
        }

        if attributes.is_empty() || !MemoryAttributes::AccessAttributesMask.contains(attributes) {
            log::error!("Unsupported memory attributes {:#x}", attributes.bits());
            return Err(PtError::InvalidParameter);
        }

        // Compare against the remaining space so the end of the range is never computed.
        let max_address = ctx.capabilities().max_address();
        if base_address > max_address || length - 1 > max_address || base_address > max_address - (length - 1) {
            log::error!("Memory range {:#x} + {:#x} exceeds {:#x}", base_address, length, max_address);
            return Err(PtError::InvalidMemoryRange);
        }

        Ok(())
    }

    /// Granularity the entry mapping `address` must be split for, or `None` when the entry lies fully inside the
    /// range. Only goes to 4KB when 2MB pages cannot cover the start of the range.
    fn need_split_page(address: PhysicalAddress, length: u64, current: PageAttribute) -> Option<PageAttribute> {
        if address.is_aligned(current.length()) && length >= current.length() {
            return None;
        }

        if !address.is_aligned(SIZE_2MB) || length < SIZE_2MB {
            Some(PageAttribute::Page4K)
        } else {
            Some(PageAttribute::Page2M)
        }
    }

    /// Set (`is_set`) or clear `attributes` on every page in `[base_address, base_address + length)` of the page
    /// table selected by `ctx`, splitting large pages that only partly overlap the range.
    ///
    /// The page table is walked again after every split, so a 1GB page that must become 4KB pages is split twice.
    /// `conversion` records whether anything was split or modified. On failure, sub-ranges converted before the
    /// failing one keep their new attributes and `conversion` still reports them. TLBs are not flushed.
    ///
    /// ## Errors
    /// * Parameter errors (see [`PtError::is_invalid_parameter`]) before the page table is touched.
    /// * `PtError::Unsupported` if part of the range is not mapped.
    /// * `PtError::OutOfResources` if a split could not allocate a page table.
    pub fn convert_memory_page_attributes(
        &mut self,
        ctx: &PageTableContext,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
        is_set: bool,
        conversion: &mut RangeConversion,
    ) -> PtResult<()> {
        Self::validate_range(ctx, base_address, length, attributes)?;

        let mut address = PhysicalAddress::new(base_address);
        let mut remaining = length;
        while remaining != 0 {
            // SAFETY: the context refers to a valid page table per the contract of `new` and
            // `PageTableContext::internal`
            let (entry, current) = unsafe { get_page_table_entry::<Arch>(ctx, address) }.ok_or_else(|| {
                log::error!("Address {} is not mapped", address);
                PtError::Unsupported
            })?;

            match Self::need_split_page(address, remaining, current) {
                None => {
                    if convert_page_entry_attribute(entry, attributes, is_set, ctx) {
                        conversion.modified = true;
                    }
                    address = (address + current.length())?;
                    remaining -= current.length();
                }
                Some(target) => {
                    split_page(entry, current, target, &mut self.page_allocator, ctx.address_enc_mask())?;
                    conversion.split = true;
                    conversion.modified = true;
                }
            }
        }

        Ok(())
    }

    /// Convert the range and flush all TLBs once if the table changed, even when the conversion failed after
    /// changing part of it. Returns whether a large page was split.
    fn update_memory_attributes(
        &mut self,
        ctx: &PageTableContext,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
        is_set: bool,
    ) -> PtResult<bool> {
        let mut conversion = RangeConversion::default();
        let result =
            self.convert_memory_page_attributes(ctx, base_address, length, attributes, is_set, &mut conversion);

        if conversion.modified {
            flush_tlb_for_all::<Arch, M>(&self.mp_services);
        }

        match result {
            Ok(()) => Ok(conversion.split),
            Err(err) => {
                log::error!(
                    "Failed to {} {:?} on {:#x} + {:#x}: {}",
                    if is_set { "set" } else { "clear" },
                    attributes,
                    base_address,
                    length,
                    err
                );
                Err(err)
            }
        }
    }

    /// Set attributes on the active page table. Returns whether a large page was split.
    pub fn set_memory_attributes_ex(
        &mut self,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
    ) -> PtResult<bool> {
        let ctx = self.active_context();
        self.update_memory_attributes(&ctx, base_address, length, attributes, true)
    }

    /// Clear attributes on the active page table. Returns whether a large page was split.
    pub fn clear_memory_attributes_ex(
        &mut self,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
    ) -> PtResult<bool> {
        let ctx = self.active_context();
        self.update_memory_attributes(&ctx, base_address, length, attributes, false)
    }

    /// Mark the range as supervisor shadow stack in the page table at `cr3`, which is being prepared and is not
    /// installed: read-only, dirty and not user accessible.
    ///
    /// # Safety
    ///
    /// `cr3` must hold the address of a valid, identity mapped page table.
    pub unsafe fn set_shadow_stack(&mut self, cr3: u64, base_address: u64, length: u64) -> PtResult<()> {
        let ctx = unsafe { PageTableContext::internal(cr3, self.capabilities)? };
        self.update_memory_attributes(&ctx, base_address, length, MemoryAttributes::ReadOnly, true).map(|_| ())
    }

    /// Mark the range not present in the page table at `cr3`, which is being prepared and is not installed.
    ///
    /// # Safety
    ///
    /// `cr3` must hold the address of a valid, identity mapped page table.
    pub unsafe fn set_not_present_page(&mut self, cr3: u64, base_address: u64, length: u64) -> PtResult<()> {
        let ctx = unsafe { PageTableContext::internal(cr3, self.capabilities)? };
        self.update_memory_attributes(&ctx, base_address, length, MemoryAttributes::ReadProtect, true).map(|_| ())
    }

    /// Copy of the entry mapping `address` together with its granularity, or `None` if the address is not mapped.
    pub fn page_table_entry(&self, ctx: &PageTableContext, address: u64) -> Option<(PageTableEntry, PageAttribute)> {
        // SAFETY: see `convert_memory_page_attributes`
        unsafe { get_page_table_entry::<Arch>(ctx, PhysicalAddress::new(address)) }
            .map(|(entry, granularity)| (entry.read(), granularity))
    }

    /// Attributes shared by every page of the range in the page table selected by `ctx`. The base does not need
    /// to be aligned; the walk continues from the end of each covering entry.
    ///
    /// ## Errors
    /// * `PtError::InvalidParameter` if `length` is smaller than a page.
    /// * `PtError::InvalidMemoryRange` if the base lies beyond the physical address space.
    /// * `PtError::Unsupported` if part of the range is not mapped.
    /// * `PtError::NonUniformMemoryAttributes` if the pages do not all share the same attributes.
    pub fn query_memory_attributes(
        &self,
        ctx: &PageTableContext,
        base_address: u64,
        length: u64,
    ) -> PtResult<MemoryAttributes> {
        if length < SIZE_4KB {
            return Err(PtError::InvalidParameter);
        }
        if base_address > ctx.capabilities().max_address() {
            return Err(PtError::InvalidMemoryRange);
        }

        let mut address = PhysicalAddress::new(base_address);
        let mut remaining = length;
        let mut found: Option<MemoryAttributes> = None;
        loop {
            let (entry, granularity) = self.page_table_entry(ctx, address.into()).ok_or_else(|| {
                log::error!("Address {} is not mapped", address);
                PtError::Unsupported
            })?;

            let attributes = entry.get_attributes();
            match found {
                Some(previous) if previous != attributes => {
                    log::trace!("Attributes {:?} at {} differ from {:?}", attributes, address, previous);
                    return Err(PtError::NonUniformMemoryAttributes);
                }
                _ => found = Some(attributes),
            }

            let offset = u64::from(address) - u64::from(address.align_down(granularity));
            let step = granularity.length() - offset;
            if step >= remaining {
                return Ok(attributes);
            }
            remaining -= step;
            address = (address + step)?;
        }
    }

    /// Log every entry covering the range in the page table selected by `ctx`.
    pub fn dump_page_tables(&self, ctx: &PageTableContext, base_address: u64, length: u64) -> PtResult<()> {
        let end = base_address.checked_add(length).ok_or(PtError::AdditionOverflow)?;
        let enc_mask = ctx.address_enc_mask();

        log::info!("Page table {:?} from {:#x} to {:#x}", ctx.base(), base_address, end);
        log::info!("{:<18} {:<4} {:<18} {:<18} attributes", "address", "size", "entry", "frame");

        let mut address = PhysicalAddress::new(base_address);
        while u64::from(address) < end {
            let Some((entry, granularity)) = self.page_table_entry(ctx, address.into()) else {
                log::info!("{} not mapped", address);
                return Err(PtError::Unsupported);
            };
            let start = address.align_down(granularity);
            log::info!(
                "{} {:<4} {:#018x} {} {:?}",
                start,
                granularity,
                entry.into_bits(),
                entry.frame_address(granularity, enc_mask),
                entry.get_attributes()
            );
            address = (start + granularity.length())?;
        }

        Ok(())
    }
}

impl<P: PageAllocator, M: MpServices, Arch: SmmCpuHal> SmmMemoryAttribute for SmmPageTable<P, M, Arch> {
    fn set_memory_attributes(&mut self, base_address: u64, length: u64, attributes: MemoryAttributes) -> PtResult<()> {
        self.set_memory_attributes_ex(base_address, length, attributes).map(|_| ())
    }

    fn clear_memory_attributes(
        &mut self,
        base_address: u64,
        length: u64,
        attributes: MemoryAttributes,
    ) -> PtResult<()> {
        self.clear_memory_attributes_ex(base_address, length, attributes).map(|_| ())
    }

    fn get_memory_attributes(&self, base_address: u64, length: u64) -> PtResult<MemoryAttributes> {
        let ctx = self.active_context();
        self.query_memory_attributes(&ctx, base_address, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::MockMpServices, structs::SIZE_1GB, tests::test_cpu::TestCpu};

    type TestTable = SmmPageTable<crate::tests::test_page_allocator::TestPageAllocator, MockMpServices, TestCpu>;

    #[test]
    fn test_need_split_page() {
        let at = PhysicalAddress::new;

        // Entry fully inside the range.
        assert_eq!(TestTable::need_split_page(at(SIZE_1GB), SIZE_1GB, PageAttribute::Page1G), None);
        assert_eq!(TestTable::need_split_page(at(SIZE_2MB), SIZE_2MB, PageAttribute::Page2M), None);
        assert_eq!(TestTable::need_split_page(at(0x1000), 0x1000, PageAttribute::Page4K), None);

        // 2MB aligned and long enough: 1GB only goes down to 2MB.
        assert_eq!(
            TestTable::need_split_page(at(SIZE_1GB + SIZE_2MB), SIZE_2MB, PageAttribute::Page1G),
            Some(PageAttribute::Page2M)
        );
        assert_eq!(
            TestTable::need_split_page(at(SIZE_1GB), SIZE_1GB - SIZE_2MB, PageAttribute::Page1G),
            Some(PageAttribute::Page2M)
        );

        // Misaligned to 2MB or shorter than 2MB.
        assert_eq!(
            TestTable::need_split_page(at(SIZE_1GB + 0x1000), SIZE_2MB, PageAttribute::Page1G),
            Some(PageAttribute::Page4K)
        );
        assert_eq!(
            TestTable::need_split_page(at(SIZE_1GB), 0x1000, PageAttribute::Page1G),
            Some(PageAttribute::Page4K)
        );
        assert_eq!(
            TestTable::need_split_page(at(SIZE_2MB), SIZE_2MB - 0x1000, PageAttribute::Page2M),
            Some(PageAttribute::Page4K)
        );
    }

    #[test]
    fn test_validate_range() {
        let ctx = PageTableContext::active(CpuCapabilities::new(39, true, 0));
        let ro = MemoryAttributes::ReadOnly;
        let max = (1u64 << 39) - 1;

        assert!(TestTable::validate_range(&ctx, 0, SIZE_4KB, ro).is_ok());
        assert!(TestTable::validate_range(&ctx, max + 1 - SIZE_4KB, SIZE_4KB, ro).is_ok());
        assert!(TestTable::validate_range(&ctx, 0, max + 1, MemoryAttributes::AccessAttributesMask).is_ok());

        assert_eq!(TestTable::validate_range(&ctx, 0, 0, ro), Err(PtError::InvalidMemoryRange));
        assert_eq!(TestTable::validate_range(&ctx, 0x800, SIZE_4KB, ro), Err(PtError::UnalignedAddress));
        assert_eq!(TestTable::validate_range(&ctx, 0, 0x800, ro), Err(PtError::UnalignedMemoryRange));
        assert_eq!(
            TestTable::validate_range(&ctx, 0, SIZE_4KB, MemoryAttributes::empty()),
            Err(PtError::InvalidParameter)
        );
        assert_eq!(
            TestTable::validate_range(&ctx, 0, SIZE_4KB, MemoryAttributes::from_bits_retain(0x8)),
            Err(PtError::InvalidParameter)
        );
        assert_eq!(
            TestTable::validate_range(&ctx, max + 1 - SIZE_4KB, 2 * SIZE_4KB, ro),
            Err(PtError::InvalidMemoryRange)
        );
        assert_eq!(TestTable::validate_range(&ctx, max + 1, SIZE_4KB, ro), Err(PtError::InvalidMemoryRange));
        assert_eq!(
            TestTable::validate_range(&ctx, SIZE_4KB, u64::MAX & !(PAGE_SIZE - 1), ro),
            Err(PtError::InvalidMemoryRange)
        );
    }
}
