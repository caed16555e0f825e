//! Decoding of the instructions that touch the mmio register.
//!
//! Only byte moves between a low byte register and memory are emulated, e.g.
//! `mov [edx], al` and `mov al, [edx]`.

use crate::error::{EmulatorError, Result};
use hypervisor::svm::data::guest::Registers;
use iced_x86::{Code, Decoder, DecoderOptions, OpKind, Register};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    /// Device register into `Register`.
    Read(Register),

    /// `Register` into the device register.
    Write(Register),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioInstruction {
    pub access: MmioAccess,
    pub length: usize,
}

impl MmioInstruction {
    /// Decodes the real mode instruction at the start of `bytes`.
    pub fn decode(bytes: &[u8], rip: u64) -> Result<Self> {
        let mut decoder = Decoder::with_ip(16, bytes, rip, DecoderOptions::NONE);
        let instruction = decoder.decode();

        let access = match instruction.code() {
            Code::Mov_rm8_r8 if instruction.op0_kind() == OpKind::Memory => {
                MmioAccess::Write(instruction.op1_register())
            }
            Code::Mov_r8_rm8 if instruction.op1_kind() == OpKind::Memory => {
                MmioAccess::Read(instruction.op0_register())
            }
            _ => return Err(EmulatorError::UndecodableMmio { rip }),
        };

        let register = match access {
            MmioAccess::Read(register) | MmioAccess::Write(register) => register,
        };
        if byte_register(&mut Registers::default(), register).is_none() {
            return Err(EmulatorError::UndecodableMmio { rip });
        }

        Ok(Self {
            access,
            length: instruction.len(),
        })
    }
}

/// The register block field holding the low byte register `register`.
fn byte_register(registers: &mut Registers, register: Register) -> Option<&mut u64> {
    match register {
        Register::AL => Some(&mut registers.rax),
        Register::CL => Some(&mut registers.rcx),
        Register::DL => Some(&mut registers.rdx),
        Register::BL => Some(&mut registers.rbx),
        _ => None,
    }
}

pub fn read_byte(registers: &mut Registers, register: Register) -> Option<u8> {
    byte_register(registers, register).map(|slot| *slot as u8)
}

pub fn write_byte(registers: &mut Registers, register: Register, value: u8) -> Option<()> {
    let slot = byte_register(registers, register)?;
    *slot = (*slot & !0xff) | value as u64;

    Some(())
}
