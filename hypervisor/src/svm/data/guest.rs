use crate::svm::vmcb::save_area::SaveArea;

/// General purpose registers the control block doesn't hold, in encoding order.
///
/// The world switch addresses the fields by offset. `rax` and `rsp` only keep the
/// slots: the processor loads and saves them through the save area.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64, // +0x00
    pub rcx: u64, // +0x08
    pub rdx: u64, // +0x10
    pub rbx: u64, // +0x18
    pub rsp: u64, // +0x20
    pub rbp: u64, // +0x28
    pub rsi: u64, // +0x30
    pub rdi: u64, // +0x38
    pub r8: u64,  // +0x40
    pub r9: u64,  // +0x48
    pub r10: u64, // +0x50
    pub r11: u64, // +0x58
    pub r12: u64, // +0x60
    pub r13: u64, // +0x68
    pub r14: u64, // +0x70
    pub r15: u64, // +0x78
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x80);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rcx), 0x08);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rdi), 0x38);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x78);

/// The register block exchanged with the controlling process by `GET_REGS` and
/// `SET_REGS`. Segment fields are segment bases.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub ss: u64,
}
const_assert_eq!(core::mem::size_of::<Registers>(), 0xc0);

impl Registers {
    pub fn capture(registers: &GuestRegisters, save_area: &SaveArea) -> Self {
        Self {
            rax: save_area.rax,
            rbx: registers.rbx,
            rcx: registers.rcx,
            rdx: registers.rdx,
            rsi: registers.rsi,
            rdi: registers.rdi,
            rsp: save_area.rsp,
            rbp: registers.rbp,
            r8: registers.r8,
            r9: registers.r9,
            r10: registers.r10,
            r11: registers.r11,
            r12: registers.r12,
            r13: registers.r13,
            r14: registers.r14,
            r15: registers.r15,
            rip: save_area.rip,
            rflags: save_area.rflags,
            cs: save_area.cs.base,
            ds: save_area.ds.base,
            es: save_area.es.base,
            fs: save_area.fs.base,
            gs: save_area.gs.base,
            ss: save_area.ss.base,
        }
    }

    pub fn restore(&self, registers: &mut GuestRegisters, save_area: &mut SaveArea) {
        save_area.rax = self.rax;
        registers.rbx = self.rbx;
        registers.rcx = self.rcx;
        registers.rdx = self.rdx;
        registers.rsi = self.rsi;
        registers.rdi = self.rdi;
        save_area.rsp = self.rsp;
        registers.rbp = self.rbp;
        registers.r8 = self.r8;
        registers.r9 = self.r9;
        registers.r10 = self.r10;
        registers.r11 = self.r11;
        registers.r12 = self.r12;
        registers.r13 = self.r13;
        registers.r14 = self.r14;
        registers.r15 = self.r15;
        save_area.rip = self.rip;
        save_area.rflags = self.rflags;
        save_area.cs.base = self.cs;
        save_area.ds.base = self.ds;
        save_area.es.base = self.es;
        save_area.fs.base = self.fs;
        save_area.gs.base = self.gs;
        save_area.ss.base = self.ss;
    }
}
