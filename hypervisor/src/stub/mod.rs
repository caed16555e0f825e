//! A software platform: heap backed physical memory and a processor that
//! interprets a small real mode subset instead of running the guest.

use crate::platform::Platform;
use alloc::sync::Arc;

pub mod cpu;
pub mod interpreter;
pub mod memory;

pub use cpu::{CpuEvent, StubCpu, STUB_PID};
pub use memory::StubMemory;

pub struct StubMachine {
    pub memory: Arc<StubMemory>,
    pub cpu: Arc<StubCpu>,
}

impl StubMachine {
    pub fn new() -> Self {
        Self::with_asid_limit(cpu::STUB_ASID_LIMIT)
    }

    pub fn with_asid_limit(limit: u32) -> Self {
        let memory = StubMemory::new();
        let cpu = StubCpu::new(Arc::clone(&memory), limit);

        Self { memory, cpu }
    }

    pub fn platform(&self) -> Arc<Platform> {
        Platform::new(self.memory.clone(), self.cpu.clone(), self.cpu.clone())
    }
}

impl Default for StubMachine {
    fn default() -> Self {
        Self::new()
    }
}
