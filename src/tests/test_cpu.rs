//! Simulated processor for tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::cell::Cell;

use crate::arch::SmmCpuHal;

// Each test runs on its own thread, so every test sees its own processor.
thread_local! {
    static CR3: Cell<u64> = const { Cell::new(0) };
    static FLUSH_COUNT: Cell<usize> = const { Cell::new(0) };
}

pub struct TestCpu;

impl TestCpu {
    pub fn reset() {
        CR3.with(|cr3| cr3.set(0));
        FLUSH_COUNT.with(|count| count.set(0));
    }

    pub fn set_cr3(value: u64) {
        CR3.with(|cr3| cr3.set(value));
    }

    /// Number of TLB flushes executed on this thread.
    pub fn flush_count() -> usize {
        FLUSH_COUNT.with(|count| count.get())
    }
}

impl SmmCpuHal for TestCpu {
    fn read_cr3() -> u64 {
        CR3.with(|cr3| cr3.get())
    }

    fn flush_tlb() {
        FLUSH_COUNT.with(|count| count.set(count.get() + 1));
    }
}
