//! Services consumed from the processor and the SMM multi-processor environment.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::PtResult;

/// Routine dispatched to an application processor.
pub type ApProcedure = fn();

/// Processor primitives needed by the page table code. These are associated
/// functions because they always act on the processor executing them.
pub trait SmmCpuHal {
    /// Read the translation table base register (CR3).
    fn read_cr3() -> u64;

    /// Flush the TLB of the executing processor.
    fn flush_tlb();
}

/// Multi-processor services of the SMM environment.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait MpServices {
    /// Upper bound on the number of logical processors in SMM. Some of them may
    /// not be present.
    fn number_of_cpus(&self) -> usize;

    /// Index of the processor executing the caller.
    fn currently_executing_cpu(&self) -> usize;

    /// Run `procedure` on the processor at `cpu_index` and wait for it to finish.
    ///
    /// ## Errors
    /// * Returns `Err(PtError)` if the processor is not present or did not run the procedure.
    fn blocking_startup_this_ap(&self, procedure: ApProcedure, cpu_index: usize) -> PtResult<()>;
}
