use crate::{
    svm::vmcb::Vmcb,
    utils::alloc::{Zeroable, PAGE_SIZE},
};

/// Why the guest stopped, shared with the controlling process through a mapping
/// of the vcpu. Written only between world switches, read only after `RUN`
/// returned.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitState {
    pub exit_code: u64,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub cs_base: u64,
    pub rip: u64,
}
const_assert!(core::mem::size_of::<ExitState>() <= PAGE_SIZE);

unsafe impl Zeroable for ExitState {}

impl ExitState {
    pub fn from_vmcb(vmcb: &Vmcb) -> Self {
        Self {
            exit_code: vmcb.control_area.exit_code.as_u64(),
            exit_info_1: vmcb.control_area.exit_info1,
            exit_info_2: vmcb.control_area.exit_info2,
            cs_base: vmcb.save_area.cs.base,
            rip: vmcb.save_area.rip,
        }
    }

    /// Linear address of the instruction the guest stopped at.
    pub fn linear_rip(&self) -> u64 {
        self.cs_base.wrapping_add(self.rip)
    }
}
