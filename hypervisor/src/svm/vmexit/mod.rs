//! Decodes why the guest stopped.

use crate::svm::vmcb::control_area::{ControlArea, NptExitInfo, VmExitCode};
use bitfield::bitfield;

bitfield! {
    /// `EXITINFO1` of an I/O intercept. See `15.10.2 IN and OUT Behavior`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IoioInfo(u64);
    impl Debug;

    /// Set for `IN`, cleared for `OUT`
    pub is_in, set_in: 0;
    pub is_string, set_string: 2;
    pub is_rep, set_rep: 3;
    pub size8, set_size8: 4;
    pub size16, set_size16: 5;
    pub size32, set_size32: 6;
    pub u16, port, set_port: 31, 16;
}

impl IoioInfo {
    /// Operand size in bytes.
    pub fn size(&self) -> usize {
        if self.size32() {
            4
        } else if self.size16() {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// The guest touched guest physical memory without a present translation.
    NestedPageFault { gpa: u64, info: NptExitInfo },

    /// Single step trap after an instruction.
    Debug,

    Halt,

    Io { info: IoioInfo, next_rip: u64 },

    /// Any other exit, surfaced as is.
    Unhandled(VmExitCode),
}

impl VmExit {
    /// Reads the exit reason from the control area after `#VMEXIT`.
    ///
    /// Panics on `VMEXIT_INVALID`: the processor refused the control block, which
    /// means the engine built an inconsistent one.
    pub fn classify(control_area: &ControlArea) -> Self {
        match control_area.exit_code {
            VmExitCode::VMEXIT_INVALID => {
                panic!("vmrun failed with VMEXIT_INVALID, the guest state is inconsistent")
            }
            VmExitCode::VMEXIT_NPF => VmExit::NestedPageFault {
                gpa: control_area.exit_info2,
                info: NptExitInfo::from_bits_truncate(control_area.exit_info1),
            },
            VmExitCode::VMEXIT_EXCEPTION_DB => VmExit::Debug,
            VmExitCode::VMEXIT_HLT => VmExit::Halt,
            VmExitCode::VMEXIT_IOIO => VmExit::Io {
                info: IoioInfo(control_area.exit_info1),
                next_rip: control_area.exit_info2,
            },
            code => VmExit::Unhandled(code),
        }
    }

    pub fn code(&self) -> VmExitCode {
        match self {
            VmExit::NestedPageFault { .. } => VmExitCode::VMEXIT_NPF,
            VmExit::Debug => VmExitCode::VMEXIT_EXCEPTION_DB,
            VmExit::Halt => VmExitCode::VMEXIT_HLT,
            VmExit::Io { .. } => VmExitCode::VMEXIT_IOIO,
            VmExit::Unhandled(code) => *code,
        }
    }
}
