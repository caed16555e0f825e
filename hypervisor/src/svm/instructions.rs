//! The privileged SVM instructions.
//!
//! [`Svm`] is the seam between the engine and the processor; [`HardwareSvm`]
//! executes the real instructions on x86_64.

use crate::{svm::data::guest::GuestRegisters, utils::addresses::PhysicalAddress};

pub trait Svm: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Number of ASIDs the processor supports.
    fn max_asid(&self) -> u32;

    /// Sets `EFER.SVME` on the current processor.
    ///
    /// # Safety
    ///
    /// Preemption must be disabled.
    unsafe fn enable(&self);

    /// Writes `VM_HSAVE_PA` of the current processor.
    ///
    /// # Safety
    ///
    /// `pa` must be a page owned by the caller for the duration of the world switch.
    unsafe fn set_host_save_area(&self, pa: PhysicalAddress);

    /// # Safety
    ///
    /// Must be paired with [`Svm::stgi`] on the same processor.
    unsafe fn clgi(&self);

    /// # Safety
    ///
    /// Only after [`Svm::clgi`].
    unsafe fn stgi(&self);

    /// # Safety
    ///
    /// `vmcb` must be a control block owned by the caller.
    unsafe fn vmsave(&self, vmcb: PhysicalAddress);

    /// # Safety
    ///
    /// `vmcb` must hold state saved by [`Svm::vmsave`].
    unsafe fn vmload(&self, vmcb: PhysicalAddress);

    /// Loads the guest, runs it until the next `#VMEXIT` and saves it again. The
    /// general purpose registers the control block doesn't hold are swapped with
    /// `registers`.
    ///
    /// # Safety
    ///
    /// Preemption disabled, GIF cleared, `EFER.SVME` set and the host save area
    /// registered on the current processor.
    unsafe fn vmrun(&self, vmcb: PhysicalAddress, registers: &mut GuestRegisters);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use crate::svm::{msr::{EFER_SVME, SVM_MSR_VM_HSAVE_PA}, support};
        use core::arch::asm;
        use x86::msr::{rdmsr, wrmsr, IA32_EFER};

        pub struct HardwareSvm;

        impl Svm for HardwareSvm {
            fn is_supported(&self) -> bool {
                support::is_svm_supported()
            }

            fn max_asid(&self) -> u32 {
                support::max_asid()
            }

            unsafe fn enable(&self) {
                let efer = rdmsr(IA32_EFER);
                if efer & EFER_SVME == 0 {
                    wrmsr(IA32_EFER, efer | EFER_SVME);
                }
            }

            unsafe fn set_host_save_area(&self, pa: PhysicalAddress) {
                wrmsr(SVM_MSR_VM_HSAVE_PA, pa.as_u64());
            }

            unsafe fn clgi(&self) {
                asm!("clgi", options(nomem, nostack));
            }

            unsafe fn stgi(&self) {
                asm!("stgi", options(nomem, nostack));
            }

            unsafe fn vmsave(&self, vmcb: PhysicalAddress) {
                asm!("vmsave rax", in("rax") vmcb.as_u64(), options(nostack));
            }

            unsafe fn vmload(&self, vmcb: PhysicalAddress) {
                asm!("vmload rax", in("rax") vmcb.as_u64(), options(nostack));
            }

            unsafe fn vmrun(&self, vmcb: PhysicalAddress, registers: &mut GuestRegisters) {
                // rax and rsp come from the control block. rbx and rbp can't be
                // operands, so they are saved on the stack together with the
                // register block pointer.
                //
                asm!(
                    "push rbp",
                    "push rbx",
                    "push rdi",
                    "mov rcx, [rdi + 0x08]",
                    "mov rdx, [rdi + 0x10]",
                    "mov rbx, [rdi + 0x18]",
                    "mov rbp, [rdi + 0x28]",
                    "mov rsi, [rdi + 0x30]",
                    "mov r8,  [rdi + 0x40]",
                    "mov r9,  [rdi + 0x48]",
                    "mov r10, [rdi + 0x50]",
                    "mov r11, [rdi + 0x58]",
                    "mov r12, [rdi + 0x60]",
                    "mov r13, [rdi + 0x68]",
                    "mov r14, [rdi + 0x70]",
                    "mov r15, [rdi + 0x78]",
                    "mov rdi, [rdi + 0x38]",
                    "vmload rax",
                    "vmrun rax",
                    "vmsave rax",
                    "push rdi",
                    "mov rdi, [rsp + 0x08]",
                    "mov [rdi + 0x08], rcx",
                    "mov [rdi + 0x10], rdx",
                    "mov [rdi + 0x18], rbx",
                    "mov [rdi + 0x28], rbp",
                    "mov [rdi + 0x30], rsi",
                    "mov [rdi + 0x40], r8",
                    "mov [rdi + 0x48], r9",
                    "mov [rdi + 0x50], r10",
                    "mov [rdi + 0x58], r11",
                    "mov [rdi + 0x60], r12",
                    "mov [rdi + 0x68], r13",
                    "mov [rdi + 0x70], r14",
                    "mov [rdi + 0x78], r15",
                    "pop rcx",
                    "mov [rdi + 0x38], rcx",
                    "pop rdi",
                    "pop rbx",
                    "pop rbp",
                    inout("rax") vmcb.as_u64() => _,
                    inout("rdi") registers as *mut GuestRegisters => _,
                    out("rcx") _,
                    out("rdx") _,
                    out("rsi") _,
                    out("r8") _,
                    out("r9") _,
                    out("r10") _,
                    out("r11") _,
                    out("r12") _,
                    out("r13") _,
                    out("r14") _,
                    out("r15") _,
                );
            }
        }
    }
}
