//! TLB shootdown across every processor in SMM.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use crate::arch::{MpServices, SmmCpuHal};

/// Flush the TLB of the executing processor, then have every other processor flush its own and wait for each of
/// them in turn. Processors that cannot be started are skipped; the processor count in SMM is an upper bound and
/// some of them may not be present.
pub fn flush_tlb_for_all<Arch: SmmCpuHal, M: MpServices + ?Sized>(mp_services: &M) {
    Arch::flush_tlb();

    let current = mp_services.currently_executing_cpu();
    for cpu_index in (0..mp_services.number_of_cpus()).filter(|&index| index != current) {
        if let Err(err) = mp_services.blocking_startup_this_ap(Arch::flush_tlb, cpu_index) {
            log::trace!("Processor {} did not flush its TLB: {:?}", cpu_index, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::{always, eq};

    use super::*;
    use crate::{arch::MockMpServices, tests::test_cpu::TestCpu, PtError};

    #[test]
    fn test_flush_skips_current_processor() {
        TestCpu::reset();
        let mut mp = MockMpServices::new();
        mp.expect_number_of_cpus().return_const(4usize);
        mp.expect_currently_executing_cpu().return_const(2usize);
        for cpu in [0usize, 1, 3] {
            mp.expect_blocking_startup_this_ap().with(always(), eq(cpu)).times(1).returning(|procedure, _| {
                procedure();
                Ok(())
            });
        }

        flush_tlb_for_all::<TestCpu, _>(&mp);
        // Local flush plus one per remote processor, all on this test thread.
        assert_eq!(TestCpu::flush_count(), 4);
    }

    #[test]
    fn test_flush_tolerates_absent_processors() {
        TestCpu::reset();
        let mut mp = MockMpServices::new();
        mp.expect_number_of_cpus().return_const(3usize);
        mp.expect_currently_executing_cpu().return_const(0usize);
        mp.expect_blocking_startup_this_ap()
            .with(always(), eq(1usize))
            .times(1)
            .returning(|_, _| Err(PtError::Unsupported));
        mp.expect_blocking_startup_this_ap().with(always(), eq(2usize)).times(1).returning(|_, _| Ok(()));

        flush_tlb_for_all::<TestCpu, _>(&mp);
        assert_eq!(TestCpu::flush_count(), 1);
    }
}
