use crate::{
    platform::Host,
    stub::{interpreter::Interpreter, memory::StubMemory},
    svm::{data::guest::GuestRegisters, instructions::Svm, vmcb::Vmcb},
    utils::addresses::PhysicalAddress,
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

pub const STUB_PID: u32 = 1337;
pub const STUB_ASID_LIMIT: u32 = 64;

/// Privileged operations seen by the stub processor, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    PreemptDisable,
    PreemptEnable,
    Clgi,
    Stgi,
    Enable,
    SetHostSaveArea(PhysicalAddress),
    Vmsave(PhysicalAddress),
    Vmrun(PhysicalAddress),
    Vmload(PhysicalAddress),
}

struct CpuState {
    preempt_count: u32,
    gif: bool,
    svme: bool,
    host_save_area: Option<PhysicalAddress>,
    events: Vec<CpuEvent>,
}

/// A processor and host kernel in software.
///
/// `vmrun` checks that the world switch was set up properly and then interprets
/// the guest until it exits.
pub struct StubCpu {
    memory: Arc<StubMemory>,
    asid_limit: u32,
    signal: AtomicBool,
    relaxed: AtomicUsize,
    state: Mutex<CpuState>,
}

impl StubCpu {
    pub fn new(memory: Arc<StubMemory>, asid_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            memory,
            asid_limit,
            signal: AtomicBool::new(false),
            relaxed: AtomicUsize::new(0),
            state: Mutex::new(CpuState {
                preempt_count: 0,
                gif: true,
                svme: false,
                host_save_area: None,
                events: Vec::new(),
            }),
        })
    }

    /// Makes the current thread look like it has a signal pending.
    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::SeqCst);
    }

    pub fn clear_signal(&self) {
        self.signal.store(false, Ordering::SeqCst);
    }

    /// How often a waiter gave up the processor.
    pub fn relax_count(&self) -> usize {
        self.relaxed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<CpuEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn preempt_count(&self) -> u32 {
        self.state.lock().preempt_count
    }

    pub fn gif(&self) -> bool {
        self.state.lock().gif
    }

    fn record(&self, event: CpuEvent) {
        self.state.lock().events.push(event);
    }
}

impl Host for StubCpu {
    fn preempt_disable(&self) {
        let mut state = self.state.lock();
        state.preempt_count += 1;
        state.events.push(CpuEvent::PreemptDisable);
    }

    fn preempt_enable(&self) {
        let mut state = self.state.lock();
        assert!(state.preempt_count > 0, "unbalanced preempt_enable");
        state.preempt_count -= 1;
        state.events.push(CpuEvent::PreemptEnable);
    }

    fn relax(&self) {
        self.relaxed.fetch_add(1, Ordering::SeqCst);
        core::hint::spin_loop();
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    fn current_pid(&self) -> u32 {
        STUB_PID
    }
}

impl Svm for StubCpu {
    fn is_supported(&self) -> bool {
        true
    }

    fn max_asid(&self) -> u32 {
        self.asid_limit
    }

    unsafe fn enable(&self) {
        let mut state = self.state.lock();
        state.svme = true;
        state.events.push(CpuEvent::Enable);
    }

    unsafe fn set_host_save_area(&self, pa: PhysicalAddress) {
        let mut state = self.state.lock();
        state.host_save_area = Some(pa);
        state.events.push(CpuEvent::SetHostSaveArea(pa));
    }

    unsafe fn clgi(&self) {
        let mut state = self.state.lock();
        assert!(state.gif, "clgi with GIF already clear");
        state.gif = false;
        state.events.push(CpuEvent::Clgi);
    }

    unsafe fn stgi(&self) {
        let mut state = self.state.lock();
        state.gif = true;
        state.events.push(CpuEvent::Stgi);
    }

    unsafe fn vmsave(&self, vmcb: PhysicalAddress) {
        assert!(self.memory.phys_to_virt(vmcb.as_u64()).is_some(), "vmsave to unknown page");
        self.record(CpuEvent::Vmsave(vmcb));
    }

    unsafe fn vmload(&self, vmcb: PhysicalAddress) {
        assert!(self.memory.phys_to_virt(vmcb.as_u64()).is_some(), "vmload from unknown page");
        self.record(CpuEvent::Vmload(vmcb));
    }

    unsafe fn vmrun(&self, vmcb: PhysicalAddress, registers: &mut GuestRegisters) {
        {
            let mut state = self.state.lock();
            assert!(state.preempt_count > 0, "vmrun with preemption enabled");
            assert!(!state.gif, "vmrun with GIF set");
            assert!(state.svme, "vmrun with EFER.SVME clear");
            assert!(state.host_save_area.is_some(), "vmrun without host save area");
            state.events.push(CpuEvent::Vmrun(vmcb));
        }

        let Some(vmcb) = self.memory.phys_to_virt(vmcb.as_u64()) else {
            panic!("vmrun on unknown page {:#x}", vmcb);
        };
        let vmcb = &mut *(vmcb.as_ptr() as *mut Vmcb);

        Interpreter::new(&self.memory, vmcb, registers).run();
    }
}
