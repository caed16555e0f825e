//! The world switch.

use crate::{
    platform::Platform,
    svm::{
        data::guest::GuestRegisters,
        vmcb::{HostSaveArea, Vmcb},
    },
    utils::alloc::PhysicalBox,
};

/// Witness that the current thread can't be preempted and that the global
/// interrupt flag is clear. Dropping it undoes both, in reverse order.
pub struct WorldSwitchGuard<'a> {
    platform: &'a Platform,
}

impl<'a> WorldSwitchGuard<'a> {
    pub fn enter(platform: &'a Platform) -> Self {
        platform.host().preempt_disable();
        unsafe { platform.svm().clgi() };

        Self { platform }
    }
}

impl Drop for WorldSwitchGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.platform.svm().stgi() };
        self.platform.host().preempt_enable();
    }
}

/// Runs the guest until the next `#VMEXIT`.
///
/// State that `vmrun` doesn't switch (FS, GS, TR, LDTR, the syscall MSRs, ...) is
/// saved into `host_vmcb` before and reloaded from it after.
///
/// # Safety
///
/// `guest_vmcb` must describe a consistent guest and every physical address it
/// holds (IOPM, nCR3) must stay valid for the duration of the call.
pub unsafe fn world_switch(
    guard: &WorldSwitchGuard<'_>, host_save_area: &PhysicalBox<HostSaveArea>,
    host_vmcb: &PhysicalBox<Vmcb>, guest_vmcb: &PhysicalBox<Vmcb>,
    registers: &mut GuestRegisters,
) {
    let svm = guard.platform.svm();

    svm.enable();
    svm.set_host_save_area(host_save_area.pa());
    svm.vmsave(host_vmcb.pa());
    svm.vmrun(guest_vmcb.pa(), registers);
    svm.vmload(host_vmcb.pa());
}
