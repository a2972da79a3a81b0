//! Page table selection and the processor capabilities the engine depends on.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::{
    arch::SmmCpuHal,
    structs::{PhysicalAddress, SIZE_4GB},
    PtError, PtResult,
};

/// Mask of the page table base address held in CR3.
pub const CR3_PAGE_BASE_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Widest physical address 4-level paging can translate. Wider addresses alias onto lower ones in the walk.
pub const MAX_PHYSICAL_ADDRESS_BITS: u8 = 48;

/// Processor features that shape how entries are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// Physical address width reported by the processor.
    pub physical_address_bits: u8,
    /// Whether the no-execute bit may be used.
    pub nx_supported: bool,
    /// Memory encryption bit pattern OR'd into every table pointer and frame address.
    pub address_enc_mask: u64,
    /// Whether 1GB pages may be used when building page tables.
    pub page_1g_supported: bool,
}

impl CpuCapabilities {
    pub const fn new(physical_address_bits: u8, nx_supported: bool, address_enc_mask: u64) -> Self {
        Self { physical_address_bits, nx_supported, address_enc_mask, page_1g_supported: true }
    }

    pub const fn with_nx(mut self, nx_supported: bool) -> Self {
        self.nx_supported = nx_supported;
        self
    }

    pub const fn with_address_enc_mask(mut self, address_enc_mask: u64) -> Self {
        self.address_enc_mask = address_enc_mask;
        self
    }

    pub const fn with_1g_pages(mut self, page_1g_supported: bool) -> Self {
        self.page_1g_supported = page_1g_supported;
        self
    }

    /// Highest physical address reachable through the page table, limited by both the processor and 4-level
    /// paging.
    pub fn max_address(&self) -> u64 {
        let bits = self.physical_address_bits.min(MAX_PHYSICAL_ADDRESS_BITS);
        (1u64 << bits) - 1
    }

    /// Check the capabilities describe a processor with at least 4GB of physical address space.
    pub fn validate(&self) -> PtResult<()> {
        if self.max_address() < SIZE_4GB - 1 {
            log::error!("Unsupported physical address width {}", self.physical_address_bits);
            return Err(PtError::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for CpuCapabilities {
    fn default() -> Self {
        Self::new(39, true, 0)
    }
}

/// Where the root table of the page table being operated on lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableBase {
    /// The table currently installed in CR3.
    Active,
    /// A table that is being prepared and is not installed.
    Internal(PhysicalAddress),
}

/// The page table an operation acts on together with the capabilities used to encode its entries.
///
/// Converting an entry to read-only behaves differently depending on the base: an internal table is being
/// prepared for shadow stacks, so the dirty bit is set and user access removed, while the active table has the
/// dirty bit cleared so the first write faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableContext {
    base: PageTableBase,
    capabilities: CpuCapabilities,
}

impl PageTableContext {
    /// Context acting on the page table installed in CR3.
    pub fn active(capabilities: CpuCapabilities) -> Self {
        Self { base: PageTableBase::Active, capabilities }
    }

    /// Context acting on a page table that is not installed.
    ///
    /// # Safety
    ///
    /// `base` must be the identity mapped address of a valid level 4 table, and every table reachable from it
    /// must stay valid for as long as the context is used.
    pub unsafe fn internal(base: u64, capabilities: CpuCapabilities) -> PtResult<Self> {
        let base = PhysicalAddress::new(base & CR3_PAGE_BASE_ADDRESS_MASK & !capabilities.address_enc_mask);
        if u64::from(base) == 0 {
            log::error!("Internal page table base cannot be zero");
            return Err(PtError::InvalidParameter);
        }
        Ok(Self { base: PageTableBase::Internal(base), capabilities })
    }

    pub fn base(&self) -> PageTableBase {
        self.base
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.base, PageTableBase::Internal(_))
    }

    pub fn capabilities(&self) -> &CpuCapabilities {
        &self.capabilities
    }

    pub fn address_enc_mask(&self) -> u64 {
        self.capabilities.address_enc_mask
    }

    /// Address of the level 4 table this context refers to.
    pub fn resolve_base<Arch: SmmCpuHal>(&self) -> PhysicalAddress {
        match self.base {
            PageTableBase::Active => {
                PhysicalAddress::new(Arch::read_cr3() & CR3_PAGE_BASE_ADDRESS_MASK & !self.address_enc_mask())
            }
            PageTableBase::Internal(base) => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_cpu::TestCpu;

    #[test]
    fn test_max_address() {
        assert_eq!(CpuCapabilities::new(39, true, 0).max_address(), 0x7F_FFFF_FFFF);
        assert_eq!(CpuCapabilities::new(48, true, 0).max_address(), 0x0000_FFFF_FFFF_FFFF);
        assert_eq!(CpuCapabilities::new(52, true, 0).max_address(), 0x0000_FFFF_FFFF_FFFF);
    }

    #[test]
    fn test_validate() {
        assert!(CpuCapabilities::new(32, true, 0).validate().is_ok());
        assert!(CpuCapabilities::new(46, false, 0).validate().is_ok());
        assert_eq!(CpuCapabilities::new(31, true, 0).validate(), Err(PtError::InvalidParameter));
        assert!(CpuCapabilities::new(52, true, 0).validate().is_ok());
    }

    #[test]
    fn test_internal_context() {
        let caps = CpuCapabilities::default();
        let ctx = unsafe { PageTableContext::internal(0x1234_5FFF, caps).unwrap() };
        assert!(ctx.is_internal());
        assert_eq!(ctx.base(), PageTableBase::Internal(PhysicalAddress::new(0x1234_5000)));
        assert_eq!(ctx.resolve_base::<TestCpu>(), PhysicalAddress::new(0x1234_5000));

        assert_eq!(unsafe { PageTableContext::internal(0xFFF, caps) }, Err(PtError::InvalidParameter));
    }

    #[test]
    fn test_internal_context_strips_encryption_mask() {
        let enc = 1 << 51;
        let caps = CpuCapabilities::default().with_address_enc_mask(enc);
        let cr3 = enc | 0x0000_0000_7654_3000;
        TestCpu::set_cr3(cr3);

        let internal = unsafe { PageTableContext::internal(cr3, caps).unwrap() };
        let active = PageTableContext::active(caps);
        assert_eq!(internal.resolve_base::<TestCpu>(), PhysicalAddress::new(0x7654_3000));
        assert_eq!(internal.resolve_base::<TestCpu>(), active.resolve_base::<TestCpu>());

        assert_eq!(unsafe { PageTableContext::internal(enc, caps) }, Err(PtError::InvalidParameter));
    }

    #[test]
    fn test_active_context_reads_cr3() {
        let caps = CpuCapabilities::default().with_address_enc_mask(1 << 51);
        TestCpu::set_cr3((1 << 51) | 0x0000_0000_7654_3000 | 0x18);
        let ctx = PageTableContext::active(caps);
        assert!(!ctx.is_internal());
        assert_eq!(ctx.resolve_base::<TestCpu>(), PhysicalAddress::new(0x7654_3000));
    }
}
