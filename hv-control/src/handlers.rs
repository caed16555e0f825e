//! Default exit handlers.

use crate::{
    devices::Device,
    emulator::{ExitType, Machine},
    error::{EmulatorError, Result},
    mmio::{read_byte, write_byte, MmioAccess, MmioInstruction},
};
use hypervisor::{
    ioctl::{MMIO_HAWK_ADDRESS, PIO_HAWK_PORT},
    svm::{vmcb::control_area::NptExitInfo, vmexit::VmExit},
    utils::alloc::PAGE_SIZE,
};

const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Emulates accesses to the mmio register, backs every other page on first
/// touch.
pub fn handle_npf(machine: &mut Machine, exit: &VmExit) -> Result<ExitType> {
    let VmExit::NestedPageFault { gpa, info } = *exit else {
        unreachable!("npf handler called for {:?}", exit)
    };

    if gpa & !(PAGE_SIZE as u64 - 1) == MMIO_HAWK_ADDRESS {
        emulate_mmio(machine, gpa)?;
        return Ok(ExitType::Continue);
    }

    if info.contains(NptExitInfo::PRESENT) {
        log::error!("Guest violated the permissions of {:#x} ({:?})", gpa, info);
        return Err(EmulatorError::ProtectionFault { gpa });
    }

    machine.vm.map_page(gpa)?;
    log::debug!("Mapped guest page {:#x}", gpa & !(PAGE_SIZE as u64 - 1));

    Ok(ExitType::Continue)
}

fn emulate_mmio(machine: &mut Machine, gpa: u64) -> Result<()> {
    if gpa != MMIO_HAWK_ADDRESS {
        return Err(EmulatorError::UnexpectedMmio { gpa });
    }

    let state = machine.exit_state.read();
    let ip = state.linear_rip();

    // Instructions crossing into the next page aren't supported.
    //
    let length = MAX_INSTRUCTION_LENGTH.min(PAGE_SIZE - ip as usize % PAGE_SIZE);
    let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
    machine.vm.read_guest(ip, &mut bytes[..length])?;
    let instruction = MmioInstruction::decode(&bytes[..length], state.rip)?;

    let mut registers = machine.vcpu.registers()?;
    match instruction.access {
        MmioAccess::Write(register) => {
            let value = read_byte(&mut registers, register).ok_or(EmulatorError::UndecodableMmio { rip: ip })?;
            machine.mmio.write(value);
        }
        MmioAccess::Read(register) => {
            write_byte(&mut registers, register, machine.mmio.read())
                .ok_or(EmulatorError::UndecodableMmio { rip: ip })?;
        }
    }
    registers.rip += instruction.length as u64;
    machine.vcpu.set_registers(&registers)?;

    // The page must trap again on the next access.
    //
    machine.vm.rearm_mmio(gpa)?;

    Ok(())
}

/// Traces every instruction the guest executes.
pub fn handle_debug(machine: &mut Machine, _exit: &VmExit) -> Result<ExitType> {
    let ip = machine.exit_state.read().linear_rip();

    let mut opcode = [0u8];
    match machine.vm.read_guest(ip, &mut opcode) {
        Ok(()) => log::trace!("Guest executes instruction at {:#x}, opcode = {:#x}", ip, opcode[0]),
        Err(_) => log::trace!("Guest executes instruction at {:#x}, not mapped yet", ip),
    }

    Ok(ExitType::Continue)
}

pub fn handle_halt(machine: &mut Machine, _exit: &VmExit) -> Result<ExitType> {
    log::info!(
        "Guest halted at {:#x}",
        machine.exit_state.read().linear_rip()
    );

    Ok(ExitType::Halt)
}

/// Emulates byte accesses to the pio register.
pub fn handle_io(machine: &mut Machine, exit: &VmExit) -> Result<ExitType> {
    let VmExit::Io { info, next_rip } = *exit else {
        unreachable!("io handler called for {:?}", exit)
    };

    if info.size() != 1 {
        return Err(EmulatorError::UnsupportedPortSize { size: info.size() });
    }
    if info.port() != PIO_HAWK_PORT {
        return Err(EmulatorError::UnexpectedPort { port: info.port() });
    }

    let mut registers = machine.vcpu.registers()?;
    if info.is_in() {
        registers.rax = (registers.rax & !0xff) | machine.pio.read() as u64;
    } else {
        machine.pio.write(registers.rax as u8);
    }

    // The next instruction is in `EXITINFO2`.
    //
    registers.rip = next_rip;
    machine.vcpu.set_registers(&registers)?;

    Ok(ExitType::Continue)
}
