//! Services the hypervisor needs from the machine and from the host kernel.

use crate::{svm::instructions::Svm, utils::alloc::PageAllocator};
use alloc::sync::Arc;

/// Scheduler and process services of the host kernel.
pub trait Host: Send + Sync {
    /// Pins the calling thread to the current physical processor. Calls nest.
    fn preempt_disable(&self);

    fn preempt_enable(&self);

    /// Gives up the processor while waiting for a vcpu another thread is
    /// running, `schedule()` in a kernel.
    fn relax(&self);

    /// Whether the calling thread has a signal pending.
    fn signal_pending(&self) -> bool;

    fn current_pid(&self) -> u32;
}

pub struct Platform {
    allocator: Arc<dyn PageAllocator>,
    svm: Arc<dyn Svm>,
    host: Arc<dyn Host>,
}

impl Platform {
    pub fn new(
        allocator: Arc<dyn PageAllocator>, svm: Arc<dyn Svm>, host: Arc<dyn Host>,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            svm,
            host,
        })
    }

    pub fn allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.allocator
    }

    pub fn svm(&self) -> &dyn Svm {
        self.svm.as_ref()
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }
}
