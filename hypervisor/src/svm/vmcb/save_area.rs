use crate::svm::msr::{EFER_SVME, PAT_RESET_VALUE};
use bitflags::bitflags;

bitflags! {
    /// Packed attribute word of a segment register in the save area. This is the
    /// descriptor's bits 40..48 and 52..56 squashed together.
    pub struct SegmentAttribute: u16 {
        const TYPE_ACCESSED     = 1 << 0;
        /// Writable for data segments
        const TYPE_WRITE        = 1 << 1;
        /// Readable for code segments
        const TYPE_READ         = 1 << 1;
        const TYPE_CODE         = 1 << 3;
        /// Code or data segment (not a system segment)
        const S                 = 1 << 4;
        const DPL               = 3 << 5;
        const P                 = 1 << 7;
        const AVL               = 1 << 8;
        const L                 = 1 << 9;
        const DB                = 1 << 10;
        const G                 = 1 << 11;

        const SYSTEM_LDT        = 0x2;
        const SYSTEM_BUSY_TSS16 = 0x3;
    }
}

// Size: 0x10
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}
const_assert_eq!(core::mem::size_of::<SegmentRegister>(), 0x10);

impl SegmentRegister {
    pub const fn new(selector: u16, attrib: SegmentAttribute, limit: u32, base: u64) -> Self {
        Self {
            selector,
            attrib: attrib.bits(),
            limit,
            base,
        }
    }

    /// `gdtr` and `idtr` only use the limit and the base.
    pub const fn descriptor_table(limit: u32, base: u64) -> Self {
        Self {
            selector: 0,
            attrib: 0,
            limit,
            base,
        }
    }

    pub fn attributes(&self) -> SegmentAttribute {
        SegmentAttribute::from_bits_truncate(self.attrib)
    }
}

// Size: 0x298
#[repr(C)]
pub struct SaveArea {
    pub es: SegmentRegister,             // +0x000
    pub cs: SegmentRegister,             // +0x010
    pub ss: SegmentRegister,             // +0x020
    pub ds: SegmentRegister,             // +0x030
    pub fs: SegmentRegister,             // +0x040
    pub gs: SegmentRegister,             // +0x050
    pub gdtr: SegmentRegister,           // +0x060
    pub ldtr: SegmentRegister,           // +0x070
    pub idtr: SegmentRegister,           // +0x080
    pub tr: SegmentRegister,             // +0x090
    pub reserved1: [u8; 0xcb - 0xa0],    // +0x0a0
    pub cpl: u8,                         // +0x0cb
    pub reserved2: u32,                  // +0x0cc
    pub efer: u64,                       // +0x0d0
    pub reserved3: [u8; 0x148 - 0xd8],   // +0x0d8
    pub cr4: u64,                        // +0x148
    pub cr3: u64,                        // +0x150
    pub cr0: u64,                        // +0x158
    pub dr7: u64,                        // +0x160
    pub dr6: u64,                        // +0x168
    pub rflags: u64,                     // +0x170
    pub rip: u64,                        // +0x178
    pub reserved4: [u8; 0x1d8 - 0x180],  // +0x180
    pub rsp: u64,                        // +0x1d8
    pub s_cet: u64,                      // +0x1e0
    pub ssp: u64,                        // +0x1e8
    pub isst_addr: u64,                  // +0x1f0
    pub rax: u64,                        // +0x1f8
    pub star: u64,                       // +0x200
    pub lstar: u64,                      // +0x208
    pub cstar: u64,                      // +0x210
    pub sf_mask: u64,                    // +0x218
    pub kernel_gs_base: u64,             // +0x220
    pub sysenter_cs: u64,                // +0x228
    pub sysenter_esp: u64,               // +0x230
    pub sysenter_eip: u64,               // +0x238
    pub cr2: u64,                        // +0x240
    pub reserved5: [u8; 0x268 - 0x248],  // +0x248
    pub gpat: u64,                       // +0x268
    pub dbg_ctl: u64,                    // +0x270
    pub br_from: u64,                    // +0x278
    pub br_to: u64,                      // +0x280
    pub last_excep_from: u64,            // +0x288
    pub last_excep_to: u64,              // +0x290
}
const_assert_eq!(core::mem::size_of::<SaveArea>(), 0x298);

pub const RESET_CR0: u64 = 0x6000_0010;
pub const RESET_RIP: u64 = 0xfff0;
pub const RESET_CS_SELECTOR: u16 = 0xf000;
pub const RESET_CS_BASE: u64 = 0xffff_0000;
pub const RESET_DR6: u64 = 0xffff_0ff0;
pub const RESET_DR7: u64 = 0x400;

/// Reserved bit 1 which always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;
pub const RFLAGS_TF: u64 = 1 << 8;

impl SaveArea {
    /// Puts the guest into the state of a processor coming out of reset: real
    /// mode, executing at `0xfffffff0`.
    ///
    /// The trap flag is set so every instruction ends in a `#DB` exit.
    pub fn load_reset_state(&mut self) {
        let data = SegmentAttribute::P | SegmentAttribute::S | SegmentAttribute::TYPE_WRITE;
        let code = SegmentAttribute::P
            | SegmentAttribute::S
            | SegmentAttribute::TYPE_READ
            | SegmentAttribute::TYPE_CODE;

        self.cs = SegmentRegister::new(RESET_CS_SELECTOR, code, 0xffff, RESET_CS_BASE);
        self.ds = SegmentRegister::new(0, data, 0xffff, 0);
        self.es = self.ds;
        self.fs = self.ds;
        self.gs = self.ds;
        self.ss = self.ds;

        self.gdtr = SegmentRegister::descriptor_table(0xffff, 0);
        self.idtr = SegmentRegister::descriptor_table(0xffff, 0);
        self.ldtr = SegmentRegister::new(
            0,
            SegmentAttribute::P | SegmentAttribute::SYSTEM_LDT,
            0xffff,
            0,
        );
        self.tr = SegmentRegister::new(
            0,
            SegmentAttribute::P | SegmentAttribute::SYSTEM_BUSY_TSS16,
            0xffff,
            0,
        );

        self.cpl = 0;
        self.efer = EFER_SVME;
        self.cr0 = RESET_CR0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr6 = RESET_DR6;
        self.dr7 = RESET_DR7;
        self.rflags = RFLAGS_RESERVED | RFLAGS_TF;
        self.rip = RESET_RIP;
        self.rsp = 0;
        self.rax = 0;
        self.gpat = PAT_RESET_VALUE;
    }
}
