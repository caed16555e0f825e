use hv_control::{Emulator, EmulatorError, ExitType, Machine, VmExitType};
use hypervisor::{
    ioctl::{GUEST_ENTRY, MMIO_HAWK_ADDRESS},
    stub::StubMachine,
    svm::{vcpu::VcpuState, vmcb::control_area::VmExitCode, vmexit::VmExit, Hypervisor},
    Error,
};

/// mov al, 1; mov dx, 0x10; out dx, al; 1: in al, dx; cmp al, 2; jne 1b; hlt
const PIO_GUEST: [u8; 12] = [0xb0, 0x01, 0xba, 0x10, 0x00, 0xee, 0xec, 0x3c, 0x02, 0x75, 0xfb, 0xf4];

/// mov edx, 0x1000; mov al, 5; mov [edx], al; mov al, [edx]; hlt
const MMIO_GUEST: [u8; 15] = [
    0x66, 0xba, 0x00, 0x10, 0x00, 0x00, 0xb0, 0x05, 0x67, 0x88, 0x02, 0x67, 0x8a, 0x02, 0xf4,
];

fn setup() -> (StubMachine, Hypervisor) {
    let machine = StubMachine::new();
    let hypervisor = Hypervisor::new(machine.platform()).unwrap();

    (machine, hypervisor)
}

#[test]
fn test_pio_scenario() {
    let (stub, hypervisor) = setup();

    let mut emulator = Emulator::builder().build(&hypervisor, &PIO_GUEST).unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.exit_count(VmExitType::Io), 2);
    assert_eq!(emulator.exit_count(VmExitType::Halt), 1);
    assert_eq!(emulator.exit_count(VmExitType::NestedPageFault), 0);
    assert!(emulator.exit_count(VmExitType::Debug) > 0);

    let machine = emulator.machine();
    let registers = machine.vcpu.registers().unwrap();
    assert_eq!(registers.rax & 0xff, 2);
    assert_eq!(registers.cs + registers.rip, GUEST_ENTRY + 11);
    assert_eq!(machine.vcpu.state().unwrap(), VcpuState::Halted);

    let state = machine.exit_state.read();
    assert_eq!(state.exit_code, VmExitCode::VMEXIT_HLT.as_u64());

    drop(emulator);
    assert_eq!(stub.memory.outstanding_pages(), 0);
    assert_eq!(stub.memory.allocations(), stub.memory.frees());
}

#[test]
fn test_mmio_scenario() {
    let (stub, hypervisor) = setup();

    let mut emulator = Emulator::builder().build(&hypervisor, &MMIO_GUEST).unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.exit_count(VmExitType::NestedPageFault), 2);
    assert_eq!(emulator.exit_count(VmExitType::Halt), 1);

    let machine = emulator.into_machine();
    assert_eq!(machine.vcpu.registers().unwrap().rax & 0xff, 4);

    // Still armed after the emulated accesses.
    //
    let entry = machine.vm.translate(MMIO_HAWK_ADDRESS).unwrap();
    assert!(!entry.is_present());

    drop(machine);
    assert_eq!(stub.memory.outstanding_pages(), 0);
}

#[test]
fn test_guest_pages_are_mapped_on_demand() {
    let (_stub, hypervisor) = setup();

    // mov al, [0x3000]; hlt
    //
    let mut emulator = Emulator::builder()
        .build(&hypervisor, &[0x8a, 0x06, 0x00, 0x30, 0xf4])
        .unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.exit_count(VmExitType::NestedPageFault), 1);
    assert!(emulator.machine().vm.guest_page(0x3000).is_ok());
    assert_eq!(emulator.machine().vcpu.registers().unwrap().rax & 0xff, 0);
}

#[test]
fn test_custom_handler() {
    fn stop_on_io(machine: &mut Machine, exit: &VmExit) -> hv_control::error::Result<ExitType> {
        assert!(matches!(exit, VmExit::Io { .. }));
        assert_eq!(machine.exit_state.read().exit_code, VmExitCode::VMEXIT_IOIO.as_u64());

        Ok(ExitType::Halt)
    }

    let (_stub, hypervisor) = setup();

    let mut emulator = Emulator::builder()
        .with_handler(VmExitType::Io, stop_on_io)
        .build(&hypervisor, &PIO_GUEST)
        .unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.exit_count(VmExitType::Io), 1);
    assert_eq!(emulator.exit_count(VmExitType::Halt), 0);
}

#[test]
fn test_unhandled_exit() {
    let (_stub, hypervisor) = setup();

    // cpuid
    //
    let mut emulator = Emulator::builder().build(&hypervisor, &[0x0f, 0xa2]).unwrap();

    let error = emulator.run().unwrap_err();
    assert!(matches!(
        error,
        EmulatorError::UnhandledExit { code, rip } if code == VmExitCode::VMEXIT_EXCEPTION_UD.as_u64() && rip == GUEST_ENTRY
    ));
    assert_eq!(
        emulator.exit_count(VmExitType::Other(VmExitCode::VMEXIT_EXCEPTION_UD)),
        1
    );
}

#[test]
fn test_unexpected_port() {
    let (_stub, hypervisor) = setup();

    // out 0x20, al
    //
    let mut emulator = Emulator::builder().build(&hypervisor, &[0xe6, 0x20]).unwrap();
    assert!(matches!(
        emulator.run(),
        Err(EmulatorError::UnexpectedPort { port: 0x20 })
    ));
}

#[test]
fn test_build_out_of_memory() {
    let (stub, hypervisor) = setup();

    stub.memory.fail_after(3);
    assert!(matches!(
        Emulator::builder().build(&hypervisor, &PIO_GUEST),
        Err(EmulatorError::Hypervisor(Error::OutOfMemory { .. }))
    ));
    assert_eq!(stub.memory.outstanding_pages(), 0);
}
