//! SVM related model specific registers and their bits.

/// See `15.30.1 VM_CR MSR (C001_0114h)`.
pub const SVM_MSR_VM_CR: u32 = 0xc001_0114;
pub const SVM_VM_CR_SVMDIS: u64 = 1 << 4;

/// Physical address of the page the processor saves host state to on `vmrun`.
pub const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

pub const EFER_SVME: u64 = 1 << 12;

/// Power-on value of the PAT MSR, used as the guest PAT under nested paging.
pub const PAT_RESET_VALUE: u64 = 0x0007_0406_0007_0406;
