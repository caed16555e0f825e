use crate::{
    error::{NotMappedSnafu, Result, VcpuExistsSnafu},
    ioctl::VmCommand,
    platform::Platform,
    svm::{
        asid::AsidAllocator,
        data::nested_page_table::NestedPageTable,
        paging::NptEntry,
        vcpu::{Vcpu, VcpuHandle},
    },
    utils::{addresses::PhysicalAddress, alloc::PAGE_SIZE},
};
use alloc::{format, string::String, sync::Arc};
use snafu::prelude::*;
use spin::Mutex;

pub struct Vm {
    id: String,
    platform: Arc<Platform>,
    asids: Arc<AsidAllocator>,

    /// Root of the nested page table, fixed for the lifetime of the vm.
    ncr3: PhysicalAddress,
    nested_page_table: Mutex<NestedPageTable>,

    /// Set at most once.
    vcpu: Mutex<Option<Arc<Vcpu>>>,
}

impl Vm {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // The vcpu references the nested page table, so it goes first.
        //
        drop(self.vcpu.get_mut().take());
        self.nested_page_table.get_mut().destroy();

        log::info!("Destroyed vm {}", self.id);
    }
}

/// Result of a vm command.
pub enum VmReply {
    Vcpu(VcpuHandle),
    Mapped(PhysicalAddress),
    Done,
}

/// A reference to a vm. Every handle, including the ones of its vcpu, keeps the
/// vm alive; the last one to go tears it down.
pub struct VmHandle {
    vm: Arc<Vm>,
}

impl VmHandle {
    pub(crate) fn create(platform: &Arc<Platform>, asids: &Arc<AsidAllocator>) -> Result<Self> {
        let nested_page_table = NestedPageTable::new(platform.allocator())?;
        let id = format!("vm-{}", platform.host().current_pid());

        log::info!("Created vm {}", id);

        Ok(Self {
            vm: Arc::new(Vm {
                id,
                platform: Arc::clone(platform),
                asids: Arc::clone(asids),
                ncr3: nested_page_table.root(),
                nested_page_table: Mutex::new(nested_page_table),
                vcpu: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.vm.id()
    }

    /// Number of handles keeping the vm alive.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.vm)
    }

    /// Creates the only vcpu of the vm.
    pub fn create_vcpu(&self) -> Result<VcpuHandle> {
        if self.vm.vcpu.lock().is_some() {
            return self.vcpu_exists();
        }

        // Built without the slot lock. The loser of a race throws its vcpu away
        // before it got an ASID.
        //
        let mut vcpu = Vcpu::new(&self.vm.platform, self.vm.ncr3)?;

        let mut slot = self.vm.vcpu.lock();
        if slot.is_some() {
            drop(slot);
            return self.vcpu_exists();
        }
        vcpu.assign_asid(self.vm.asids.allocate());

        let vcpu = Arc::new(vcpu);
        *slot = Some(Arc::clone(&vcpu));
        drop(slot);

        Ok(VcpuHandle::new(Arc::clone(&self.vm), vcpu))
    }

    fn vcpu_exists<T>(&self) -> Result<T> {
        log::warn!("Vm {} already has a vcpu", self.vm.id);
        VcpuExistsSnafu { vm: self.vm.id.as_str() }.fail()
    }

    /// Backs the page containing `gpa` with a fresh zeroed host page.
    pub fn map_page(&self, gpa: u64) -> Result<PhysicalAddress> {
        self.vm.nested_page_table.lock().ensure_mapped(gpa, false)
    }

    /// Backs the page containing `gpa` with a page every access to which traps.
    pub fn map_mmio(&self, gpa: u64) -> Result<PhysicalAddress> {
        self.vm.nested_page_table.lock().ensure_mapped(gpa, true)
    }

    pub fn rearm_mmio(&self, gpa: u64) -> Result<()> {
        self.vm.nested_page_table.lock().rearm_mmio(gpa)
    }

    pub fn translate(&self, gpa: u64) -> Option<NptEntry> {
        self.vm.nested_page_table.lock().translate(gpa)
    }

    /// Host page backing the present guest page at `gpa`, what a fault on the vm
    /// mapping resolves to.
    pub fn guest_page(&self, gpa: u64) -> Result<PhysicalAddress> {
        self.translate(gpa)
            .filter(|entry| entry.is_present())
            .map(|entry| entry.address())
            .context(NotMappedSnafu { gpa })
    }

    /// Copies guest memory starting at `gpa` into `buffer`.
    pub fn read_guest(&self, gpa: u64, buffer: &mut [u8]) -> Result<()> {
        let nested_page_table = self.vm.nested_page_table.lock();

        let mut done = 0;
        while done < buffer.len() {
            let address = gpa
                .checked_add(done as u64)
                .context(NotMappedSnafu { gpa })?;
            let offset = address as usize % PAGE_SIZE;
            let length = (PAGE_SIZE - offset).min(buffer.len() - done);

            let page = nested_page_table
                .host_page(address)
                .context(NotMappedSnafu { gpa: address })?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    page.as_ptr().add(offset),
                    buffer[done..].as_mut_ptr(),
                    length,
                )
            };

            done += length;
        }

        Ok(())
    }

    /// Copies `data` into guest memory starting at `gpa`.
    pub fn write_guest(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let nested_page_table = self.vm.nested_page_table.lock();

        let mut done = 0;
        while done < data.len() {
            let address = gpa
                .checked_add(done as u64)
                .context(NotMappedSnafu { gpa })?;
            let offset = address as usize % PAGE_SIZE;
            let length = (PAGE_SIZE - offset).min(data.len() - done);

            let page = nested_page_table
                .host_page(address)
                .context(NotMappedSnafu { gpa: address })?;
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), page.as_ptr().add(offset), length)
            };

            done += length;
        }

        Ok(())
    }

    /// Executes a raw vm command. `argument` is the guest physical address of
    /// the mapping commands.
    pub fn ioctl(&self, command: u32, argument: u64) -> Result<VmReply> {
        match VmCommand::try_from(command)? {
            VmCommand::CreateVcpu => self.create_vcpu().map(VmReply::Vcpu),
            VmCommand::MapPage => self.map_page(argument).map(VmReply::Mapped),
            VmCommand::MapMmio => self.map_mmio(argument).map(VmReply::Mapped),
            VmCommand::RearmMmio => self.rearm_mmio(argument).map(|_| VmReply::Done),
        }
    }

    #[cfg(test)]
    pub(crate) fn nested_page_count(&self) -> (usize, usize) {
        let nested_page_table = self.vm.nested_page_table.lock();
        (nested_page_table.table_count(), nested_page_table.page_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        ioctl::{HYPERVISOR_CREATE_VCPU, HYPERVISOR_GET_REGS, HYPERVISOR_MAP_PAGE, HYPERVISOR_RUN, HYPERVISOR_SET_REGS},
        stub::{CpuEvent, StubMachine},
        svm::{
            data::guest::Registers,
            vcpu::VcpuState,
            vmcb::control_area::{NptExitInfo, VmExitCode},
            vmexit::VmExit,
            Hypervisor,
        },
    };

    /// Pages a vcpu owns: two vmcbs, the host save area, three io permission map
    /// pages and the exit state.
    const VCPU_PAGES: usize = 7;

    fn setup() -> (StubMachine, Hypervisor) {
        let machine = StubMachine::new();
        let hypervisor = Hypervisor::new(machine.platform()).unwrap();

        (machine, hypervisor)
    }

    #[test]
    fn test_create_vm() {
        let (machine, hypervisor) = setup();

        let vm = hypervisor.create_vm().unwrap();
        assert_eq!(vm.id(), "vm-1337");
        assert_eq!(vm.refcount(), 1);
        assert_eq!(vm.nested_page_count(), (1, 0));
        assert_eq!(machine.memory.outstanding_pages(), 1);

        drop(vm);
        assert_eq!(machine.memory.outstanding_pages(), 0);
    }

    #[test]
    fn test_create_vm_out_of_memory() {
        let (machine, hypervisor) = setup();

        machine.memory.fail_after(0);
        assert!(matches!(hypervisor.create_vm(), Err(Error::OutOfMemory { .. })));
        assert_eq!(machine.memory.outstanding(), 0);
    }

    #[test]
    fn test_second_vcpu_is_rejected() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();

        let vcpu = vm.create_vcpu().unwrap();
        assert_eq!(vm.refcount(), 2);
        let outstanding = machine.memory.outstanding_pages();
        assert_eq!(outstanding, 1 + VCPU_PAGES);

        let error = vm.create_vcpu().err().unwrap();
        assert!(matches!(error, Error::VcpuExists { ref vm } if vm == "vm-1337"));
        assert_eq!(error.errno(), crate::error::EEXIST);
        assert_eq!(machine.memory.outstanding_pages(), outstanding);
        assert_eq!(vm.refcount(), 2);

        drop(vcpu);
    }

    #[test]
    fn test_rejected_vcpus_take_no_asid() {
        let machine = StubMachine::with_asid_limit(4);
        let hypervisor = Hypervisor::new(machine.platform()).unwrap();

        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        assert_eq!(vcpu.asid(), 1);
        let allocations = machine.memory.allocations();

        for _ in 0..16 {
            assert!(matches!(vm.create_vcpu(), Err(Error::VcpuExists { .. })));
        }
        assert_eq!(machine.memory.allocations(), allocations);

        let other = hypervisor.create_vm().unwrap();
        assert_eq!(other.create_vcpu().unwrap().asid(), 2);
    }

    #[test]
    fn test_concurrent_vcpu_creation() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();

        let results = std::thread::scope(|scope| {
            let threads = (0..8)
                .map(|_| scope.spawn(|| vm.create_vcpu()))
                .collect::<std::vec::Vec<_>>();

            threads
                .into_iter()
                .map(|thread| thread.join().unwrap())
                .collect::<std::vec::Vec<_>>()
        });

        let winners = results.iter().filter(|result| result.is_ok()).count();
        let losers = results
            .iter()
            .filter(|result| matches!(result, Err(Error::VcpuExists { .. })))
            .count();
        assert_eq!((winners, losers), (1, 7));
        assert!(results.iter().flatten().all(|vcpu| vcpu.asid() == 1));
        assert_eq!(machine.memory.outstanding_pages(), 1 + VCPU_PAGES);

        drop(results);
        drop(vm);
        assert_eq!(machine.memory.outstanding_pages(), 0);
        assert_eq!(machine.memory.allocations(), machine.memory.frees());
    }

    #[test]
    fn test_create_vcpu_out_of_memory() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();

        for budget in 0..5 {
            machine.memory.fail_after(budget);
            assert!(matches!(vm.create_vcpu(), Err(Error::OutOfMemory { .. })));
            assert_eq!(machine.memory.outstanding_pages(), 1);
        }

        machine.memory.reset_failures();
        assert!(vm.create_vcpu().is_ok());
    }

    #[test]
    fn test_close_vcpu_then_vm() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        drop(vcpu);
        assert_eq!(vm.refcount(), 1);
        assert_eq!(machine.memory.outstanding_pages(), 1 + VCPU_PAGES);

        drop(vm);
        assert_eq!(machine.memory.outstanding_pages(), 0);
        assert_eq!(machine.memory.allocations(), machine.memory.frees());
    }

    #[test]
    fn test_close_vm_then_vcpu() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        vm.map_page(0x1_0000).unwrap();

        drop(vm);
        assert_eq!(vcpu.vm_id(), "vm-1337");
        assert!(machine.memory.outstanding_pages() > 0);

        drop(vcpu);
        assert_eq!(machine.memory.outstanding_pages(), 0);
        assert_eq!(machine.memory.allocations(), machine.memory.frees());
    }

    #[test]
    fn test_world_switch_sequence() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        vcpu.run().unwrap();

        let events = machine.cpu.events();
        let [CpuEvent::PreemptDisable, CpuEvent::Clgi, CpuEvent::Enable, CpuEvent::SetHostSaveArea(_), CpuEvent::Vmsave(host), CpuEvent::Vmrun(guest), CpuEvent::Vmload(loaded), CpuEvent::Stgi, CpuEvent::PreemptEnable] =
            events.as_slice()
        else {
            panic!("unexpected world switch sequence {:?}", events);
        };
        assert_eq!(host, loaded);
        assert_ne!(host, guest);

        assert_eq!(machine.cpu.preempt_count(), 0);
        assert!(machine.cpu.gif());
    }

    #[test]
    fn test_reset_vector_faults() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        let exit_state = vcpu.mmap(0, PAGE_SIZE).unwrap();
        assert_eq!(exit_state.read().exit_code, 0);

        let exit = vcpu.run().unwrap();
        let VmExit::NestedPageFault { gpa, info } = exit else {
            panic!("expected a nested page fault, got {:?}", exit);
        };
        assert_eq!(gpa & !0xfff, 0xffff_f000);
        assert!(!info.contains(NptExitInfo::PRESENT));
        assert!(info.contains(NptExitInfo::ID | NptExitInfo::GUEST_PA));

        let state = exit_state.read();
        assert_eq!(state.exit_code, VmExitCode::VMEXIT_NPF.as_u64());
        assert_eq!(state.exit_info_2, 0xffff_fff0);
        assert_eq!(state.linear_rip(), 0xffff_fff0);
        assert_eq!(vcpu.state().unwrap(), VcpuState::Trapped);

        drop(exit_state);
        drop(vcpu);
        drop(vm);
        assert_eq!(machine.memory.outstanding_pages(), 0);
    }

    #[test]
    fn test_halt_at_reset_vector() {
        let (_machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        vm.map_page(0xffff_f000).unwrap();
        vm.write_guest(0xffff_fff0, &[0xf4]).unwrap();
        assert_eq!(vcpu.state().unwrap(), VcpuState::Created);

        assert_eq!(vcpu.run().unwrap(), VmExit::Halt);
        assert_eq!(vcpu.state().unwrap(), VcpuState::Halted);
        assert_eq!(vcpu.registers().unwrap().rip, 0xfff0);
    }

    #[test]
    fn test_single_step_traps_after_each_instruction() {
        let (_machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        // mov al, 0x2a; nop; hlt
        //
        vm.map_page(0xffff_f000).unwrap();
        vm.write_guest(0xffff_fff0, &[0xb0, 0x2a, 0x90, 0xf4]).unwrap();

        assert_eq!(vcpu.run().unwrap(), VmExit::Debug);
        let registers = vcpu.registers().unwrap();
        assert_eq!(registers.rax, 0x2a);
        assert_eq!(registers.rip, 0xfff2);

        assert_eq!(vcpu.run().unwrap(), VmExit::Debug);
        assert_eq!(vcpu.run().unwrap(), VmExit::Halt);
    }

    #[test]
    fn test_registers_round_trip_through_commands() {
        let (_machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let VmReply::Vcpu(vcpu) = vm.ioctl(HYPERVISOR_CREATE_VCPU, 0).unwrap() else {
            panic!("expected a vcpu");
        };

        let mut registers = Registers::default();
        vcpu.ioctl(HYPERVISOR_GET_REGS, &mut registers).unwrap();
        assert_eq!(registers.cs, 0xffff_0000);
        assert_eq!(registers.rip, 0xfff0);
        assert_eq!(registers.rflags, 0x102);

        registers.cs = 0x1_0000;
        registers.rip = 0;
        registers.rbx = 0xdead;
        vcpu.ioctl(HYPERVISOR_SET_REGS, &mut registers).unwrap();

        let VmReply::Mapped(_) = vm.ioctl(HYPERVISOR_MAP_PAGE, 0x1_0000).unwrap() else {
            panic!("expected a mapping");
        };
        vm.write_guest(0x1_0000, &[0xf4]).unwrap();

        let mut scratch = Registers::default();
        let code = vcpu.ioctl(HYPERVISOR_RUN, &mut scratch).unwrap();
        assert_eq!(code, VmExitCode::VMEXIT_HLT.as_u64());
        assert_eq!(vcpu.registers().unwrap().rbx, 0xdead);

        assert!(matches!(vm.ioctl(HYPERVISOR_RUN, 0), Err(Error::UnknownCommand { .. })));
        assert!(matches!(
            vcpu.ioctl(HYPERVISOR_MAP_PAGE, &mut scratch),
            Err(Error::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_interrupted_while_waiting() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        let held = vcpu.vcpu().try_hold().unwrap();
        machine.cpu.raise_signal();

        assert!(matches!(vcpu.run(), Err(Error::Interrupted)));
        assert!(matches!(vcpu.registers(), Err(Error::Interrupted)));
        assert!(vcpu.run().unwrap_err().is_retryable());
        assert!(machine.cpu.events().is_empty());

        drop(held);
        machine.cpu.clear_signal();
        assert!(vcpu.run().is_ok());
    }

    #[test]
    fn test_waiter_relaxes_until_vcpu_is_free() {
        let (machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        let held = vcpu.vcpu().try_hold().unwrap();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| vcpu.run());

            while machine.cpu.relax_count() == 0 {
                std::thread::yield_now();
            }
            assert!(machine.cpu.events().is_empty());

            drop(held);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert!(machine.cpu.events().contains(&CpuEvent::Clgi));
    }

    #[test]
    fn test_exit_state_mapping() {
        let (_machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();
        let vcpu = vm.create_vcpu().unwrap();

        assert!(matches!(
            vcpu.mmap(PAGE_SIZE as u64, PAGE_SIZE),
            Err(Error::InvalidMapping { offset: 0x1000, length: 0x1000 })
        ));
        assert!(matches!(vcpu.mmap(0, 2 * PAGE_SIZE), Err(Error::InvalidMapping { .. })));

        let mapping = vcpu.mmap(0, PAGE_SIZE).unwrap();
        assert!(mapping.physical_address().is_page_aligned());
        assert_eq!(vm.refcount(), 3);
    }

    #[test]
    fn test_guest_memory_access() {
        let (_machine, hypervisor) = setup();
        let vm = hypervisor.create_vm().unwrap();

        assert!(matches!(vm.guest_page(0x2000), Err(Error::NotMapped { gpa: 0x2000 })));
        assert!(matches!(
            vm.write_guest(0x2ffe, &[1, 2, 3, 4]),
            Err(Error::NotMapped { gpa: 0x2ffe })
        ));

        vm.map_page(0x2000).unwrap();
        vm.map_page(0x3000).unwrap();
        vm.write_guest(0x2ffe, &[1, 2, 3, 4]).unwrap();

        let mut buffer = [0u8; 4];
        vm.read_guest(0x2ffe, &mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);

        // Ranges running past the end of the address space.
        //
        assert!(matches!(vm.read_guest(u64::MAX - 1, &mut buffer), Err(Error::NotMapped { .. })));
        assert!(matches!(vm.write_guest(u64::MAX, &[1, 2]), Err(Error::NotMapped { .. })));

        // Trapped pages can't be accessed directly.
        //
        vm.map_mmio(0x1000).unwrap();
        assert!(vm.read_guest(0x1000, &mut buffer).is_err());
        assert!(vm.guest_page(0x1000).is_err());
        assert!(vm.guest_page(0x2000).is_ok());
    }

    #[test]
    #[should_panic(expected = "ran out of address space identifiers")]
    fn test_asid_exhaustion() {
        let machine = StubMachine::with_asid_limit(3);
        let hypervisor = Hypervisor::new(machine.platform()).unwrap();

        let vms = (0..3).map(|_| hypervisor.create_vm().unwrap()).collect::<std::vec::Vec<_>>();
        let _vcpus = vms
            .iter()
            .map(|vm| vm.create_vcpu().unwrap())
            .collect::<std::vec::Vec<_>>();
    }

    #[test]
    fn test_injected_asid_allocator() {
        let machine = StubMachine::new();
        let hypervisor = Hypervisor::new(machine.platform())
            .unwrap()
            .with_asid_allocator(Arc::new(AsidAllocator::new(100)));

        let first = hypervisor.create_vm().unwrap();
        let second = hypervisor.create_vm().unwrap();
        assert_eq!(first.create_vcpu().unwrap().asid(), 1);
        assert_eq!(second.create_vcpu().unwrap().asid(), 2);
    }
}
