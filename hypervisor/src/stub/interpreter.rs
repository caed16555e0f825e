//! Executes a guest in software the way `vmrun` would, for the subset of real
//! mode code the tests use.
//!
//! Guest physical memory is reached through the nested page tables the engine
//! built, so missing or trapped pages produce the same nested page faults as on
//! hardware. Anything outside the subset exits with `#UD`.

use crate::{
    stub::memory::StubMemory,
    svm::{
        data::{guest::GuestRegisters, io_permission_map::IoPermissionMap},
        msr::EFER_SVME,
        paging::{EntryFlags, Level, NptEntry, PAGE_SHIFT, PFN_MASK},
        vmcb::{
            control_area::{intercept, NpEnable, NptExitInfo, VmExitCode},
            save_area::RFLAGS_TF,
            Vmcb,
        },
        vmexit::IoioInfo,
    },
};
use core::ptr::NonNull;
use iced_x86::{Code, Decoder, DecoderError, DecoderOptions, Instruction, OpKind, Register};

/// Instructions executed before the guest is forced out with an interrupt exit.
const STEP_LIMIT: usize = 100_000;

const MAX_INSTRUCTION_LENGTH: usize = 15;
const REAL_MODE_IP_MASK: u64 = 0xffff;
const RFLAGS_ZF: u64 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Fetch,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Low8,
    High8,
    Word,
    Dword,
    Qword,
}

#[derive(Debug, Clone, Copy)]
struct Exit {
    code: VmExitCode,
    info1: u64,
    info2: u64,
}

impl Exit {
    const fn new(code: VmExitCode) -> Self {
        Self {
            code,
            info1: 0,
            info2: 0,
        }
    }

    fn nested_page_fault(gpa: u64, access: Access, info: NptExitInfo) -> Self {
        let mut info = info | NptExitInfo::US | NptExitInfo::GUEST_PA;
        match access {
            Access::Fetch => info |= NptExitInfo::ID,
            Access::Write => info |= NptExitInfo::RW,
            Access::Read => {}
        }

        Self {
            code: VmExitCode::VMEXIT_NPF,
            info1: info.bits(),
            info2: gpa,
        }
    }
}

pub struct Interpreter<'a> {
    memory: &'a StubMemory,
    vmcb: &'a mut Vmcb,
    registers: &'a mut GuestRegisters,
}

impl<'a> Interpreter<'a> {
    pub fn new(memory: &'a StubMemory, vmcb: &'a mut Vmcb, registers: &'a mut GuestRegisters) -> Self {
        Self {
            memory,
            vmcb,
            registers,
        }
    }

    /// Runs the guest until something is intercepted and stores the exit in the
    /// control area.
    pub fn run(mut self) {
        let exit = if self.is_consistent() {
            self.execute()
        } else {
            Exit::new(VmExitCode::VMEXIT_INVALID)
        };

        let control_area = &mut self.vmcb.control_area;
        control_area.exit_code = exit.code;
        control_area.exit_info1 = exit.info1;
        control_area.exit_info2 = exit.info2;
    }

    /// The subset of the `vmrun` consistency checks the engine could get wrong.
    fn is_consistent(&self) -> bool {
        let control_area = &self.vmcb.control_area;

        control_area.is_intercepted(intercept::VMRUN)
            && control_area.guest_asid != 0
            && control_area.np_enable.contains(NpEnable::NESTED_PAGING)
            && self.vmcb.save_area.efer & EFER_SVME != 0
    }

    fn execute(&mut self) -> Exit {
        for _ in 0..STEP_LIMIT {
            if let Err(exit) = self.step() {
                return exit;
            }

            let single_step = self.vmcb.save_area.rflags & RFLAGS_TF != 0;
            let intercepted = self
                .vmcb
                .control_area
                .is_intercepted(intercept::exception(x86::irq::DEBUG_VECTOR));
            if single_step && intercepted {
                return Exit::new(VmExitCode::VMEXIT_EXCEPTION_DB);
            }
        }

        Exit::new(VmExitCode::VMEXIT_INTR)
    }

    /// Executes one instruction. Intercepted instructions leave `rip` at the
    /// instruction and put the next one into `nrip`.
    fn step(&mut self) -> Result<(), Exit> {
        let instruction = self.fetch()?;
        let next_rip = instruction.next_ip() & REAL_MODE_IP_MASK;

        match instruction.code() {
            Code::Nopw | Code::Nopd => {}
            Code::Mov_r8_imm8 => {
                self.write_register(instruction.op0_register(), instruction.immediate8() as u64)?
            }
            Code::Mov_r16_imm16 => {
                self.write_register(instruction.op0_register(), instruction.immediate16() as u64)?
            }
            Code::Mov_r32_imm32 => {
                self.write_register(instruction.op0_register(), instruction.immediate32() as u64)?
            }
            Code::Cmp_AL_imm8 => {
                let al = self.read_register(Register::AL)? as u8;
                self.set_zero_flag(al == instruction.immediate8());
            }
            code @ (Code::Je_rel8_16 | Code::Jne_rel8_16 | Code::Jmp_rel8_16) => {
                let zero = self.vmcb.save_area.rflags & RFLAGS_ZF != 0;
                let taken = match code {
                    Code::Je_rel8_16 => zero,
                    Code::Jne_rel8_16 => !zero,
                    _ => true,
                };

                if taken {
                    self.vmcb.save_area.rip = instruction.near_branch16() as u64;
                    return Ok(());
                }
            }
            Code::Hlt => {
                self.vmcb.control_area.nrip = next_rip;

                // Without the intercept the guest would wait for an interrupt
                // that never comes.
                //
                return Err(if self.vmcb.control_area.is_intercepted(intercept::HLT) {
                    Exit::new(VmExitCode::VMEXIT_HLT)
                } else {
                    Exit::new(VmExitCode::VMEXIT_INTR)
                });
            }
            code @ (Code::In_AL_DX | Code::Out_DX_AL | Code::In_AL_imm8 | Code::Out_imm8_AL) => {
                let port = match code {
                    Code::In_AL_DX | Code::Out_DX_AL => self.read_register(Register::DX)? as u16,
                    _ => instruction.immediate8() as u16,
                };
                let is_in = matches!(code, Code::In_AL_DX | Code::In_AL_imm8);

                if self.is_io_intercepted(port) {
                    let mut info = IoioInfo(0);
                    info.set_in(is_in);
                    info.set_size8(true);
                    info.set_port(port);

                    self.vmcb.control_area.nrip = next_rip;
                    return Err(Exit {
                        code: VmExitCode::VMEXIT_IOIO,
                        info1: info.0,
                        info2: next_rip,
                    });
                }

                // Nothing answers on ports that aren't intercepted.
                //
                if is_in {
                    self.write_register(Register::AL, 0xff)?;
                }
            }
            Code::Mov_rm8_r8 => {
                let value = self.read_register(instruction.op1_register())?;
                if instruction.op0_kind() == OpKind::Memory {
                    let gpa = self.effective_address(&instruction)?;
                    self.write_memory(gpa, value as u8)?;
                } else {
                    self.write_register(instruction.op0_register(), value)?;
                }
            }
            Code::Mov_r8_rm8 => {
                let value = if instruction.op1_kind() == OpKind::Memory {
                    let gpa = self.effective_address(&instruction)?;
                    self.read_memory(gpa)? as u64
                } else {
                    self.read_register(instruction.op1_register())?
                };
                self.write_register(instruction.op0_register(), value)?;
            }
            _ => return Err(Exit::new(VmExitCode::VMEXIT_EXCEPTION_UD)),
        }

        self.vmcb.save_area.rip = next_rip;
        Ok(())
    }

    fn fetch(&self) -> Result<Instruction, Exit> {
        let rip = self.vmcb.save_area.rip;
        let linear = self.vmcb.save_area.cs.base.wrapping_add(rip);

        let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        let mut length = 0;
        let mut fault = None;
        for (offset, byte) in bytes.iter_mut().enumerate() {
            match self.translate(linear + offset as u64, Access::Fetch) {
                Ok(pointer) => *byte = unsafe { pointer.as_ptr().read_volatile() },
                Err(exit) => {
                    fault = Some(exit);
                    break;
                }
            }
            length += 1;
        }

        let mut decoder = Decoder::with_ip(16, &bytes[..length], rip, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(match (decoder.last_error(), fault) {
                (DecoderError::NoMoreBytes, Some(fault)) => fault,
                _ => Exit::new(VmExitCode::VMEXIT_EXCEPTION_UD),
            });
        }

        Ok(instruction)
    }

    /// Walks the nested page tables like the processor does.
    fn translate(&self, gpa: u64, access: Access) -> Result<NonNull<u8>, Exit> {
        let reserved = || Exit::nested_page_fault(gpa, access, NptExitInfo::PRESENT | NptExitInfo::RSV);

        let mut table = self.vmcb.control_area.ncr3 & PFN_MASK;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            let entries = self.memory.phys_to_virt(table).ok_or_else(reserved)?;
            let entry = unsafe {
                (entries.as_ptr() as *const NptEntry)
                    .add(level.index(gpa))
                    .read_volatile()
            };

            if !entry.is_present() {
                return Err(Exit::nested_page_fault(gpa, access, NptExitInfo::empty()));
            }

            let mut required = EntryFlags::USER;
            if access == Access::Write {
                required |= EntryFlags::WRITABLE;
            }
            if !entry.flags().contains(required) {
                return Err(Exit::nested_page_fault(gpa, access, NptExitInfo::PRESENT));
            }

            table = entry.address().as_u64();
        }

        let page = self.memory.phys_to_virt(table).ok_or_else(reserved)?;
        let offset = (gpa & ((1 << PAGE_SHIFT) - 1)) as usize;

        NonNull::new(unsafe { page.as_ptr().add(offset) }).ok_or_else(reserved)
    }

    /// Looks the port up in the io permission map the control area points to.
    fn is_io_intercepted(&self, port: u16) -> bool {
        let control_area = &self.vmcb.control_area;
        if !control_area.is_intercepted(intercept::IOIO_PROT) {
            return false;
        }

        let Some(bitmap) = self.memory.phys_to_virt(control_area.iopm_base_pa) else {
            return false;
        };
        let map = unsafe { &*(bitmap.as_ptr() as *const IoPermissionMap) };

        map.is_intercepted(port)
    }

    fn read_memory(&self, gpa: u64) -> Result<u8, Exit> {
        let pointer = self.translate(gpa, Access::Read)?;
        Ok(unsafe { pointer.as_ptr().read_volatile() })
    }

    fn write_memory(&self, gpa: u64, value: u8) -> Result<(), Exit> {
        let pointer = self.translate(gpa, Access::Write)?;
        unsafe { pointer.as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Guest physical address of the memory operand. Paging is off, so linear
    /// and guest physical addresses are the same.
    fn effective_address(&self, instruction: &Instruction) -> Result<u64, Exit> {
        let mut offset = instruction.memory_displacement64();
        let mut mask = REAL_MODE_IP_MASK;

        for register in [instruction.memory_base(), instruction.memory_index()] {
            if register == Register::None {
                continue;
            }

            let (_, part) = Self::location(register).ok_or(Exit::new(VmExitCode::VMEXIT_EXCEPTION_UD))?;
            if part == Part::Dword {
                mask = u32::MAX as u64;
            }

            let value = self.read_register(register)?;
            let value = if register == instruction.memory_index() {
                value * instruction.memory_index_scale() as u64
            } else {
                value
            };
            offset = offset.wrapping_add(value);
        }

        let segment = match instruction.memory_segment() {
            Register::ES => &self.vmcb.save_area.es,
            Register::CS => &self.vmcb.save_area.cs,
            Register::SS => &self.vmcb.save_area.ss,
            Register::FS => &self.vmcb.save_area.fs,
            Register::GS => &self.vmcb.save_area.gs,
            _ => &self.vmcb.save_area.ds,
        };

        Ok(segment.base.wrapping_add(offset & mask))
    }

    fn set_zero_flag(&mut self, zero: bool) {
        if zero {
            self.vmcb.save_area.rflags |= RFLAGS_ZF;
        } else {
            self.vmcb.save_area.rflags &= !RFLAGS_ZF;
        }
    }

    /// Which general purpose register `register` is part of, in encoding order.
    fn location(register: Register) -> Option<(usize, Part)> {
        let location = match register {
            Register::AL => (0, Part::Low8),
            Register::CL => (1, Part::Low8),
            Register::DL => (2, Part::Low8),
            Register::BL => (3, Part::Low8),
            Register::AH => (0, Part::High8),
            Register::CH => (1, Part::High8),
            Register::DH => (2, Part::High8),
            Register::BH => (3, Part::High8),
            Register::AX => (0, Part::Word),
            Register::CX => (1, Part::Word),
            Register::DX => (2, Part::Word),
            Register::BX => (3, Part::Word),
            Register::SP => (4, Part::Word),
            Register::BP => (5, Part::Word),
            Register::SI => (6, Part::Word),
            Register::DI => (7, Part::Word),
            Register::EAX => (0, Part::Dword),
            Register::ECX => (1, Part::Dword),
            Register::EDX => (2, Part::Dword),
            Register::EBX => (3, Part::Dword),
            Register::ESP => (4, Part::Dword),
            Register::EBP => (5, Part::Dword),
            Register::ESI => (6, Part::Dword),
            Register::EDI => (7, Part::Dword),
            Register::RAX => (0, Part::Qword),
            Register::RCX => (1, Part::Qword),
            Register::RDX => (2, Part::Qword),
            Register::RBX => (3, Part::Qword),
            Register::RSP => (4, Part::Qword),
            Register::RBP => (5, Part::Qword),
            Register::RSI => (6, Part::Qword),
            Register::RDI => (7, Part::Qword),
            _ => return None,
        };

        Some(location)
    }

    /// `rax` and `rsp` live in the save area, the rest in the register block.
    fn slot(&mut self, index: usize) -> &mut u64 {
        match index {
            0 => &mut self.vmcb.save_area.rax,
            1 => &mut self.registers.rcx,
            2 => &mut self.registers.rdx,
            3 => &mut self.registers.rbx,
            4 => &mut self.vmcb.save_area.rsp,
            5 => &mut self.registers.rbp,
            6 => &mut self.registers.rsi,
            _ => &mut self.registers.rdi,
        }
    }

    fn read_register(&self, register: Register) -> Result<u64, Exit> {
        let (index, part) = Self::location(register).ok_or(Exit::new(VmExitCode::VMEXIT_EXCEPTION_UD))?;
        let value = match index {
            0 => self.vmcb.save_area.rax,
            1 => self.registers.rcx,
            2 => self.registers.rdx,
            3 => self.registers.rbx,
            4 => self.vmcb.save_area.rsp,
            5 => self.registers.rbp,
            6 => self.registers.rsi,
            _ => self.registers.rdi,
        };

        Ok(match part {
            Part::Low8 => value & 0xff,
            Part::High8 => (value >> 8) & 0xff,
            Part::Word => value & 0xffff,
            Part::Dword => value & 0xffff_ffff,
            Part::Qword => value,
        })
    }

    fn write_register(&mut self, register: Register, value: u64) -> Result<(), Exit> {
        let (index, part) = Self::location(register).ok_or(Exit::new(VmExitCode::VMEXIT_EXCEPTION_UD))?;
        let slot = self.slot(index);

        *slot = match part {
            Part::Low8 => (*slot & !0xff) | (value & 0xff),
            Part::High8 => (*slot & !0xff00) | ((value & 0xff) << 8),
            Part::Word => (*slot & !0xffff) | (value & 0xffff),
            Part::Dword => value & 0xffff_ffff,
            Part::Qword => value,
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_parts() {
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };
        let mut registers = GuestRegisters::default();
        let memory = StubMemory::new();
        let mut interpreter = Interpreter::new(&memory, &mut vmcb, &mut registers);

        interpreter.write_register(Register::RAX, 0x1122_3344_5566_7788).unwrap();
        interpreter.write_register(Register::AH, 0xab).unwrap();
        interpreter.write_register(Register::AL, 0xcd).unwrap();
        assert_eq!(interpreter.read_register(Register::AX).unwrap(), 0xabcd);
        assert_eq!(interpreter.read_register(Register::RAX).unwrap(), 0x1122_3344_5566_abcd);

        interpreter.write_register(Register::EDX, 0x1000).unwrap();
        assert_eq!(interpreter.read_register(Register::DL).unwrap(), 0);
        assert_eq!(interpreter.read_register(Register::DH).unwrap(), 0x10);

        assert!(interpreter.read_register(Register::XMM0).is_err());
        assert_eq!(registers.rdx, 0x1000);
        assert_eq!(vmcb.save_area.rax, 0x1122_3344_5566_abcd);
    }

    #[test]
    fn test_inconsistent_vmcb() {
        let mut vmcb: Vmcb = unsafe { core::mem::zeroed() };
        let mut registers = GuestRegisters::default();
        let memory = StubMemory::new();

        Interpreter::new(&memory, &mut vmcb, &mut registers).run();
        assert_eq!(vmcb.control_area.exit_code, VmExitCode::VMEXIT_INVALID);
    }
}
