use crate::{
    error::{InterruptedSnafu, InvalidMappingSnafu, OutOfMemorySnafu, Result},
    ioctl::VcpuCommand,
    platform::Platform,
    svm::{
        data::{
            exit_state::ExitState,
            guest::{GuestRegisters, Registers},
            io_permission_map::IoPermissionMap,
        },
        vm::Vm,
        vmcb::{
            control_area::{intercept, NpEnable, VmcbClean},
            HostSaveArea, Vmcb,
        },
        vmexit::VmExit,
        vmlaunch::{world_switch, WorldSwitchGuard},
    },
    utils::{
        addresses::PhysicalAddress,
        alloc::{PhysicalBox, Zeroable, PAGE_SIZE},
    },
};
use alloc::sync::Arc;
use snafu::prelude::*;
use spin::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Running,
    Trapped,
    Halted,
}

pub(crate) struct VcpuData {
    guest_vmcb: PhysicalBox<Vmcb>,

    /// Host state `vmrun` doesn't switch is saved here across the world switch.
    host_vmcb: PhysicalBox<Vmcb>,
    host_save_area: PhysicalBox<HostSaveArea>,

    // Referenced by physical address from the guest vmcb.
    _io_permission_map: PhysicalBox<IoPermissionMap>,

    registers: GuestRegisters,
    state: VcpuState,
}

pub struct Vcpu {
    platform: Arc<Platform>,
    asid: u32,

    /// Shared with the controlling process. Only written under the `data` lock.
    exit_state: PhysicalBox<ExitState>,

    data: Mutex<VcpuData>,
}

fn allocate<T: Zeroable>(platform: &Platform, object: &'static str) -> Result<PhysicalBox<T>> {
    PhysicalBox::new_zeroed(platform.allocator()).context(OutOfMemorySnafu { object })
}

impl Vcpu {
    /// Creates a vcpu in the reset state, translating guest physical memory
    /// through the nested page table at `ncr3`. It can't run before it got an
    /// ASID through [`Vcpu::assign_asid`].
    pub(crate) fn new(platform: &Arc<Platform>, ncr3: PhysicalAddress) -> Result<Self> {
        let mut guest_vmcb = allocate::<Vmcb>(platform, "guest vmcb")?;
        let host_vmcb = allocate::<Vmcb>(platform, "host vmcb")?;
        let host_save_area = allocate::<HostSaveArea>(platform, "host save area")?;
        let mut io_permission_map = allocate::<IoPermissionMap>(platform, "io permission map")?;
        let exit_state = allocate::<ExitState>(platform, "exit state")?;

        io_permission_map.intercept_all();

        let control_area = &mut guest_vmcb.control_area;
        control_area.set_intercept(intercept::VMRUN);
        control_area.set_intercept(intercept::HLT);
        control_area.set_intercept(intercept::IOIO_PROT);
        control_area.set_intercept(intercept::exception(x86::irq::DEBUG_VECTOR));
        control_area.iopm_base_pa = io_permission_map.pa().as_u64();
        control_area.np_enable = NpEnable::NESTED_PAGING;
        control_area.ncr3 = ncr3.as_u64();
        control_area.vmcb_clean = VmcbClean::empty();

        guest_vmcb.save_area.load_reset_state();

        Ok(Self {
            platform: Arc::clone(platform),
            asid: 0,
            exit_state,
            data: Mutex::new(VcpuData {
                guest_vmcb,
                host_vmcb,
                host_save_area,
                _io_permission_map: io_permission_map,
                registers: GuestRegisters::default(),
                state: VcpuState::Created,
            }),
        })
    }

    pub(crate) fn assign_asid(&mut self, asid: u32) {
        self.asid = asid;
        self.data.get_mut().guest_vmcb.control_area.guest_asid = asid;

        log::info!("Created vcpu with asid {}", asid);
    }

    /// Waits for the vcpu lock. A pending signal aborts the wait.
    fn lock(&self) -> Result<MutexGuard<'_, VcpuData>> {
        loop {
            if let Some(data) = self.data.try_lock() {
                return Ok(data);
            }

            if self.platform.host().signal_pending() {
                return InterruptedSnafu.fail();
            }

            self.platform.host().relax();
        }
    }

    /// Runs the guest until the next exit and publishes why it stopped in the
    /// exit state page.
    pub fn run(&self) -> Result<VmExit> {
        let mut data = self.lock()?;
        data.state = VcpuState::Running;

        {
            let VcpuData {
                guest_vmcb,
                host_vmcb,
                host_save_area,
                registers,
                ..
            } = &mut *data;

            let guard = WorldSwitchGuard::enter(&self.platform);
            unsafe { world_switch(&guard, host_save_area, host_vmcb, guest_vmcb, registers) };
        }

        let exit = VmExit::classify(&data.guest_vmcb.control_area);
        let exit_state = ExitState::from_vmcb(&data.guest_vmcb);
        unsafe { self.exit_state.as_ptr().write_volatile(exit_state) };

        data.state = match exit {
            VmExit::Halt => VcpuState::Halted,
            _ => VcpuState::Trapped,
        };

        log::trace!(
            "Vcpu {} exited with {:#x} at {:#x}",
            self.asid,
            exit.code(),
            exit_state.linear_rip()
        );

        Ok(exit)
    }

    pub fn registers(&self) -> Result<Registers> {
        let data = self.lock()?;

        Ok(Registers::capture(&data.registers, &data.guest_vmcb.save_area))
    }

    pub fn set_registers(&self, registers: &Registers) -> Result<()> {
        let mut data = self.lock()?;

        let VcpuData {
            guest_vmcb,
            registers: guest_registers,
            ..
        } = &mut *data;
        registers.restore(guest_registers, &mut guest_vmcb.save_area);

        Ok(())
    }

    pub fn state(&self) -> Result<VcpuState> {
        Ok(self.lock()?.state)
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    #[cfg(test)]
    pub(crate) fn try_hold(&self) -> Option<MutexGuard<'_, VcpuData>> {
        self.data.try_lock()
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        log::info!("Destroying vcpu with asid {}", self.asid);
    }
}

/// A reference to the vcpu of a vm, keeping the vm alive.
pub struct VcpuHandle {
    vm: Arc<Vm>,
    vcpu: Arc<Vcpu>,
}

impl VcpuHandle {
    pub(crate) fn new(vm: Arc<Vm>, vcpu: Arc<Vcpu>) -> Self {
        Self { vm, vcpu }
    }

    pub fn run(&self) -> Result<VmExit> {
        self.vcpu.run()
    }

    pub fn registers(&self) -> Result<Registers> {
        self.vcpu.registers()
    }

    pub fn set_registers(&self, registers: &Registers) -> Result<()> {
        self.vcpu.set_registers(registers)
    }

    pub fn state(&self) -> Result<VcpuState> {
        self.vcpu.state()
    }

    pub fn asid(&self) -> u32 {
        self.vcpu.asid()
    }

    pub fn vm_id(&self) -> &str {
        self.vm.id()
    }

    /// Executes a raw vcpu command. `registers` is the argument of `GET_REGS`
    /// and `SET_REGS`. `RUN` returns the exit code.
    pub fn ioctl(&self, command: u32, registers: &mut Registers) -> Result<u64> {
        match VcpuCommand::try_from(command)? {
            VcpuCommand::Run => Ok(self.run()?.code().as_u64()),
            VcpuCommand::GetRegs => {
                *registers = self.registers()?;
                Ok(0)
            }
            VcpuCommand::SetRegs => {
                self.set_registers(registers)?;
                Ok(0)
            }
        }
    }

    /// Maps the exit state. Only the first page of the vcpu can be mapped.
    pub fn mmap(&self, offset: u64, length: usize) -> Result<ExitStateMapping> {
        ensure!(
            offset == 0 && length == PAGE_SIZE,
            InvalidMappingSnafu { offset, length }
        );

        Ok(ExitStateMapping {
            _vm: Arc::clone(&self.vm),
            vcpu: Arc::clone(&self.vcpu),
        })
    }

    #[cfg(test)]
    pub(crate) fn vcpu(&self) -> &Vcpu {
        &self.vcpu
    }
}

/// The exit state page as seen by the controlling process.
pub struct ExitStateMapping {
    _vm: Arc<Vm>,
    vcpu: Arc<Vcpu>,
}

impl ExitStateMapping {
    pub fn physical_address(&self) -> PhysicalAddress {
        self.vcpu.exit_state.pa()
    }

    pub fn as_ptr(&self) -> *const ExitState {
        self.vcpu.exit_state.as_ptr()
    }

    /// Only meaningful after `RUN` returned.
    pub fn read(&self) -> ExitState {
        unsafe { self.as_ptr().read_volatile() }
    }
}
