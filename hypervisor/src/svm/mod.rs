use crate::{
    error::{Result, SvmNotSupportedSnafu},
    ioctl::DeviceCommand,
    platform::Platform,
    svm::{asid::AsidAllocator, vm::VmHandle},
};
use alloc::sync::Arc;
use snafu::prelude::*;

pub mod asid;
pub mod data;
pub mod instructions;
pub mod msr;
pub mod paging;
#[cfg(target_arch = "x86_64")]
pub mod support;
pub mod vcpu;
pub mod vm;
pub mod vmcb;
pub mod vmexit;
pub mod vmlaunch;

/// The control device. Every vm created through it draws its ASIDs from the
/// same allocator.
pub struct Hypervisor {
    platform: Arc<Platform>,
    asids: Arc<AsidAllocator>,
}

impl Hypervisor {
    pub fn new(platform: Arc<Platform>) -> Result<Self> {
        if !platform.svm().is_supported() {
            log::error!("SVM is not supported");
            return SvmNotSupportedSnafu.fail();
        }

        let asids = Arc::new(AsidAllocator::new(platform.svm().max_asid()));
        log::info!("Hypervisor loaded, {} address space identifiers", asids.limit());

        Ok(Self { platform, asids })
    }

    /// Shares `asids` instead of the allocator created for the processor.
    #[must_use]
    pub fn with_asid_allocator(mut self, asids: Arc<AsidAllocator>) -> Self {
        self.asids = asids;
        self
    }

    pub fn create_vm(&self) -> Result<VmHandle> {
        VmHandle::create(&self.platform, &self.asids)
    }

    /// Executes a raw device command.
    pub fn ioctl(&self, command: u32) -> Result<VmHandle> {
        match DeviceCommand::try_from(command)? {
            DeviceCommand::CreateVm => self.create_vm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        ioctl::{HYPERVISOR_CREATE_VCPU, HYPERVISOR_CREATE_VM},
        stub::StubMachine,
    };

    #[test]
    fn test_create_vm_command() {
        let machine = StubMachine::new();
        let hypervisor = Hypervisor::new(machine.platform()).unwrap();

        let vm = hypervisor.ioctl(HYPERVISOR_CREATE_VM).unwrap();
        assert_eq!(vm.id(), "vm-1337");

        assert!(matches!(
            hypervisor.ioctl(HYPERVISOR_CREATE_VCPU),
            Err(Error::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_vms_are_independent() {
        let machine = StubMachine::new();
        let hypervisor = Hypervisor::new(machine.platform()).unwrap();

        let first = hypervisor.create_vm().unwrap();
        let second = hypervisor.create_vm().unwrap();
        first.map_page(0x1000).unwrap();

        assert!(first.translate(0x1000).is_some());
        assert!(second.translate(0x1000).is_none());
        second.map_page(0x1000).unwrap();
    }
}
