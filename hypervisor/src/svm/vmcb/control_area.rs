use bitflags::bitflags;
use core::fmt;

/// Number of 32-bit intercept words at the start of the control area.
pub const MAX_INTERCEPT: usize = 6;

/// Bit indices into [`ControlArea::intercepts`]. See `Appendix B, Table B-1`.
pub mod intercept {
    pub const CR_READ_BASE: u32 = 0;
    pub const CR_WRITE_BASE: u32 = 16;
    pub const DR_READ_BASE: u32 = 32;
    pub const DR_WRITE_BASE: u32 = 48;
    pub const EXCEPTION_BASE: u32 = 64;

    // Word 3
    pub const INTR: u32 = 96;
    pub const NMI: u32 = 96 + 1;
    pub const CPUID: u32 = 96 + 18;
    pub const HLT: u32 = 96 + 24;
    pub const IOIO_PROT: u32 = 96 + 27;
    pub const MSR_PROT: u32 = 96 + 28;
    pub const SHUTDOWN: u32 = 96 + 31;

    // Word 4
    pub const VMRUN: u32 = 128;
    pub const VMMCALL: u32 = 128 + 1;

    pub const fn exception(vector: u8) -> u32 {
        EXCEPTION_BASE + vector as u32
    }
}

// Size: 0x400
#[repr(C)]
pub struct ControlArea {
    pub intercepts: [u32; MAX_INTERCEPT],    // +0x000
    pub reserved1: [u8; 0x03c - 0x018],      // +0x018
    pub pause_filter_threshold: u16,         // +0x03c
    pub pause_filter_count: u16,             // +0x03e
    pub iopm_base_pa: u64,                   // +0x040
    pub msrpm_base_pa: u64,                  // +0x048
    pub tsc_offset: u64,                     // +0x050
    pub guest_asid: u32,                     // +0x058
    pub tlb_control: TlbControl,             // +0x05c
    pub vintr: u64,                          // +0x060
    pub interrupt_shadow: u64,               // +0x068
    pub exit_code: VmExitCode,               // +0x070
    pub exit_info1: u64,                     // +0x078
    pub exit_info2: u64,                     // +0x080
    pub exit_int_info: u64,                  // +0x088
    pub np_enable: NpEnable,                 // +0x090
    pub avic_apic_bar: u64,                  // +0x098
    pub guest_pa_of_ghcb: u64,               // +0x0a0
    pub event_inj: u64,                      // +0x0a8
    pub ncr3: u64,                           // +0x0b0
    pub lbr_virtualization_enable: u64,      // +0x0b8
    pub vmcb_clean: VmcbClean,               // +0x0c0
    pub nrip: u64,                           // +0x0c8
    pub num_of_bytes_fetched: u8,            // +0x0d0
    pub guest_instruction_bytes: [u8; 15],   // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    pub reserved2: u64,                      // +0x0e8
    pub avic_logical_table_pointer: u64,     // +0x0f0
    pub avic_physical_table_pointer: u64,    // +0x0f8
    pub reserved3: u64,                      // +0x100
    pub vmcb_save_state_pointer: u64,        // +0x108
    pub reserved4: [u8; 0x400 - 0x110],      // +0x110
}

impl ControlArea {
    /// Intercepts the event with the index `bit`.
    ///
    /// Panics if the bit is outside of the intercept words: the control block
    /// would describe something else than what was asked for.
    pub fn set_intercept(&mut self, bit: u32) {
        let (word, mask) = Self::intercept_position(bit);
        self.intercepts[word] |= mask;
    }

    pub fn is_intercepted(&self, bit: u32) -> bool {
        let (word, mask) = Self::intercept_position(bit);
        self.intercepts[word] & mask != 0
    }

    fn intercept_position(bit: u32) -> (usize, u32) {
        assert!(
            (bit as usize) < MAX_INTERCEPT * 32,
            "intercept bit {} is outside of the {} intercept words",
            bit,
            MAX_INTERCEPT
        );

        ((bit / 32) as usize, 1 << (bit % 32))
    }
}

/// Exit code written by the processor on `#VMEXIT`. See `Appendix C`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VmExitCode(pub u64);

impl VmExitCode {
    pub const VMEXIT_EXCEPTION_BASE: VmExitCode = VmExitCode(0x40);
    pub const VMEXIT_EXCEPTION_DB: VmExitCode = VmExitCode(0x41);
    pub const VMEXIT_EXCEPTION_BP: VmExitCode = VmExitCode(0x43);
    pub const VMEXIT_EXCEPTION_UD: VmExitCode = VmExitCode(0x46);
    pub const VMEXIT_EXCEPTION_GP: VmExitCode = VmExitCode(0x4d);
    pub const VMEXIT_EXCEPTION_PF: VmExitCode = VmExitCode(0x4e);
    pub const VMEXIT_INTR: VmExitCode = VmExitCode(0x60);
    pub const VMEXIT_NMI: VmExitCode = VmExitCode(0x61);
    pub const VMEXIT_CPUID: VmExitCode = VmExitCode(0x72);
    pub const VMEXIT_HLT: VmExitCode = VmExitCode(0x78);
    pub const VMEXIT_IOIO: VmExitCode = VmExitCode(0x7b);
    pub const VMEXIT_MSR: VmExitCode = VmExitCode(0x7c);
    pub const VMEXIT_SHUTDOWN: VmExitCode = VmExitCode(0x7f);
    pub const VMEXIT_VMRUN: VmExitCode = VmExitCode(0x80);
    pub const VMEXIT_VMMCALL: VmExitCode = VmExitCode(0x81);
    pub const VMEXIT_NPF: VmExitCode = VmExitCode(0x400);
    pub const VMEXIT_INVALID: VmExitCode = VmExitCode(u64::MAX);

    pub const fn exception(vector: u8) -> Self {
        Self(Self::VMEXIT_EXCEPTION_BASE.0 + vector as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::LowerHex for VmExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

bitflags! {
    /// See `15.15.3 VMCB Clean Field`. Zero means the processor may not use any
    /// cached state.
    pub struct VmcbClean: u64 {
        /// Intercepts: all the intercept vectors, TSC offset, Pause Filter Count
        const I = 1 << 0;

        /// IOMSRPM: IOPM_BASE, MSRPM_BASE
        const IOPM = 1 << 1;

        const ASID = 1 << 2;

        /// V_TPR, V_IRQ, V_INTR_PRIO, V_IGN_TPR, V_INTR_MASKING, V_INTR_VECTOR
        const TPR = 1 << 3;

        /// Nested Paging: NCR3, G_PAT
        const NP = 1 << 4;

        /// CR0, CR3, CR4, EFER
        const CR_X = 1 << 5;

        /// DR6, DR7
        const DR_X = 1 << 6;

        /// GDT/IDT Limit and Base
        const DT = 1 << 7;

        /// CS/DS/SS/ES Sel/Base/Limit/Attr, CPL
        const SEG = 1 << 8;

        const CR2 = 1 << 9;
    }

    pub struct TlbControl: u32 {
        const DO_NOTHING                        = 0;

        /// Flush entire TLB (all entries, all ASIDs) on VMRUN.
        const FLUSH_ENTIRE_TLB                  = 1;

        /// Flush this guest's TLB entries.
        const FLUSH_GUEST_TLB                   = 3;

        /// Flush this guest's non-global TLB entries.
        const FLUSH_GUEST_NON_GLOBAL_TLB        = 7;
    }

    pub struct NpEnable: u64 {
        const NESTED_PAGING                     = 1 << 0;
        const SECURE_ENCRYPTED_VIRTUALIZATION   = 1 << 1;
        const ENCRYPTED_STATE                   = 1 << 2;
    }

    /// `EXITINFO1` of a nested page fault. See "Nested versus Guest Page Faults,
    /// Fault Ordering".
    pub struct NptExitInfo: u64 {
        /// Cleared to 0 if the nested page was not present, 1 otherwise
        const PRESENT           = 1 << 0;

        /// The access was a write
        const RW                = 1 << 1;

        /// The access was a user access. Nested walks always are.
        const US                = 1 << 2;

        /// Reserved bits were set in the nested page table entry
        const RSV               = 1 << 3;

        /// The access was a code read
        const ID                = 1 << 4;

        /// The fault occurred while translating the guest's final physical address
        const GUEST_PA          = 1 << 32;

        /// The fault occurred while translating the guest page tables
        const GUEST_PAGE_TABLES = 1 << 33;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> ControlArea {
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn test_set_intercept() {
        let mut control = zeroed();

        control.set_intercept(intercept::VMRUN);
        control.set_intercept(intercept::HLT);
        control.set_intercept(intercept::IOIO_PROT);
        control.set_intercept(intercept::exception(1));

        assert_eq!(control.intercepts, [0, 0, 1 << 1, (1 << 24) | (1 << 27), 1, 0]);
        assert!(control.is_intercepted(intercept::HLT));
        assert!(!control.is_intercepted(intercept::CPUID));
    }

    #[test]
    fn test_last_intercept_bit() {
        let mut control = zeroed();

        control.set_intercept(6 * 32 - 1);
        assert_eq!(control.intercepts[5], 1 << 31);
    }

    #[test]
    #[should_panic(expected = "outside of the 6 intercept words")]
    fn test_intercept_out_of_range() {
        zeroed().set_intercept(6 * 32);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(VmExitCode::exception(1), VmExitCode::VMEXIT_EXCEPTION_DB);
        assert_eq!(VmExitCode::exception(14), VmExitCode::VMEXIT_EXCEPTION_PF);
        assert_eq!(format!("{:#x}", VmExitCode::VMEXIT_NPF), "0x400");
    }
}
