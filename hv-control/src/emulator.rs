use crate::{
    devices::{MmioHawk, PioHawk},
    error::{EmulatorError, Result},
    handlers,
};
use fnv::FnvBuildHasher;
use hypervisor::{
    ioctl::{GUEST_ENTRY, GUEST_STACK, MMIO_HAWK_ADDRESS},
    svm::{
        vcpu::{ExitStateMapping, VcpuHandle},
        vm::VmHandle,
        vmcb::control_area::VmExitCode,
        vmexit::VmExit,
        Hypervisor,
    },
    utils::alloc::PAGE_SIZE,
};
use std::collections::HashMap;

/// Initial stack pointer, relative to the stack segment.
const STACK_POINTER: u64 = 0x1000;

/// What a handler is registered for.
#[derive(Hash, Eq, PartialEq, Debug, Copy, Clone)]
pub enum VmExitType {
    NestedPageFault,
    Debug,
    Halt,
    Io,
    Other(VmExitCode),
}

impl From<&VmExit> for VmExitType {
    fn from(exit: &VmExit) -> Self {
        match exit {
            VmExit::NestedPageFault { .. } => VmExitType::NestedPageFault,
            VmExit::Debug => VmExitType::Debug,
            VmExit::Halt => VmExitType::Halt,
            VmExit::Io { .. } => VmExitType::Io,
            VmExit::Unhandled(code) => VmExitType::Other(*code),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitType {
    Continue,
    Halt,
}

pub type ExitHandler = fn(&mut Machine, &VmExit) -> Result<ExitType>;

/// The guest and the devices it can reach.
pub struct Machine {
    pub vm: VmHandle,
    pub vcpu: VcpuHandle,
    pub exit_state: ExitStateMapping,
    pub pio: PioHawk,
    pub mmio: MmioHawk,
}

pub struct EmulatorBuilder {
    handlers: HashMap<VmExitType, ExitHandler, FnvBuildHasher>,
    entry: u64,
    stack: u64,
}

impl Default for EmulatorBuilder {
    fn default() -> Self {
        let mut handlers = HashMap::with_hasher(FnvBuildHasher::default());
        handlers.insert(VmExitType::NestedPageFault, handlers::handle_npf as ExitHandler);
        handlers.insert(VmExitType::Debug, handlers::handle_debug as ExitHandler);
        handlers.insert(VmExitType::Halt, handlers::handle_halt as ExitHandler);
        handlers.insert(VmExitType::Io, handlers::handle_io as ExitHandler);

        Self {
            handlers,
            entry: GUEST_ENTRY,
            stack: GUEST_STACK,
        }
    }
}

impl EmulatorBuilder {
    /// Adds the specified handler.
    ///
    /// Note: If a handler is already registered for the specified type, it will
    /// be replaced.
    #[must_use]
    pub fn with_handler(mut self, exit_type: VmExitType, handler: ExitHandler) -> Self {
        if self.handlers.insert(exit_type, handler).is_some() {
            log::debug!("Handler for {:?} was replaced", exit_type);
        }

        self
    }

    /// Adds multiple handlers at once.
    #[must_use]
    pub fn with_handlers<const N: usize>(self, handlers: [(VmExitType, ExitHandler); N]) -> Self {
        let mut instance = self;

        for (exit_type, handler) in handlers {
            instance = instance.with_handler(exit_type, handler)
        }

        instance
    }

    /// Loads the code at `entry` instead of [`GUEST_ENTRY`]. Must be page aligned.
    #[must_use]
    pub fn with_entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Creates the vm, loads `code` and points the vcpu at it.
    pub fn build(self, hypervisor: &Hypervisor, code: &[u8]) -> Result<Emulator> {
        let vm = hypervisor.create_vm()?;
        let vcpu = vm.create_vcpu()?;
        let exit_state = vcpu.mmap(0, PAGE_SIZE)?;

        let mut page = self.entry;
        while page < self.entry + code.len() as u64 {
            vm.map_page(page)?;
            page += PAGE_SIZE as u64;
        }
        vm.write_guest(self.entry, code)?;
        vm.map_mmio(MMIO_HAWK_ADDRESS)?;

        // After reset the segment bases aren't derived from the selectors until
        // a selector is loaded, so the bases can point anywhere.
        //
        let mut registers = vcpu.registers()?;
        registers.cs = self.entry;
        registers.rip = 0;
        registers.ss = self.stack;
        registers.rsp = STACK_POINTER;
        vcpu.set_registers(&registers)?;

        log::info!("Loaded {} bytes at {:#x} into {}", code.len(), self.entry, vm.id());

        Ok(Emulator {
            machine: Machine {
                vm,
                vcpu,
                exit_state,
                pio: PioHawk::default(),
                mmio: MmioHawk::default(),
            },
            handlers: self.handlers,
            exit_counts: HashMap::with_hasher(FnvBuildHasher::default()),
        })
    }
}

/// Runs the guest and dispatches every exit to the handler registered for it.
pub struct Emulator {
    machine: Machine,
    handlers: HashMap<VmExitType, ExitHandler, FnvBuildHasher>,
    exit_counts: HashMap<VmExitType, usize, FnvBuildHasher>,
}

impl Emulator {
    pub fn builder() -> EmulatorBuilder {
        EmulatorBuilder::default()
    }

    /// Runs the guest to the next exit and handles it.
    pub fn step(&mut self) -> Result<ExitType> {
        let exit = loop {
            match self.machine.vcpu.run() {
                Err(error) if error.is_retryable() => log::debug!("Run was interrupted, retrying"),
                result => break result?,
            }
        };

        let exit_type = VmExitType::from(&exit);
        *self.exit_counts.entry(exit_type).or_default() += 1;

        let Some(handler) = self.handlers.get(&exit_type) else {
            let state = self.machine.exit_state.read();
            log::error!("Improper exit code {:#x}", state.exit_code);

            return Err(EmulatorError::UnhandledExit {
                code: state.exit_code,
                rip: state.linear_rip(),
            });
        };

        handler(&mut self.machine, &exit)
    }

    /// Runs the guest until it halts.
    pub fn run(&mut self) -> Result<()> {
        while self.step()? == ExitType::Continue {}

        Ok(())
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// How often the guest exited with `exit_type`.
    pub fn exit_count(&self, exit_type: VmExitType) -> usize {
        self.exit_counts.get(&exit_type).copied().unwrap_or_default()
    }

    /// Hands the vm and vcpu back, e.g. to inspect the guest after it halted.
    pub fn into_machine(self) -> Machine {
        self.machine
    }
}
