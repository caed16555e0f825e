use alloc::string::String;
use snafu::prelude::*;

pub const EINTR: i32 = 4;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EEXIST: i32 = 17;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to allocate physical memory for the {object}"))]
    OutOfMemory { object: &'static str },

    #[snafu(display("The vm {vm} already has a vcpu"))]
    VcpuExists { vm: String },

    #[snafu(display("Guest physical address {gpa:#x} is already mapped"))]
    AlreadyMapped { gpa: u64 },

    #[snafu(display("Guest physical address {gpa:#x} is not mapped"))]
    NotMapped { gpa: u64 },

    #[snafu(display("Guest physical address {gpa:#x} is beyond the 48 bit guest physical space"))]
    AddressOutOfRange { gpa: u64 },

    #[snafu(display("Guest physical address {gpa:#x} is not an mmio page"))]
    NotMmio { gpa: u64 },

    #[snafu(display("Only the first page can be mapped, got offset {offset:#x} and length {length:#x}"))]
    InvalidMapping { offset: u64, length: usize },

    #[snafu(display("Unknown control command {command:#x}"))]
    UnknownCommand { command: u32 },

    #[snafu(display("Interrupted while waiting for the vcpu"))]
    Interrupted,

    #[snafu(display("The processor does not support SVM"))]
    SvmNotSupported,
}

impl Error {
    /// The errno the control device reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::OutOfMemory { .. } => ENOMEM,
            Error::VcpuExists { .. } | Error::AlreadyMapped { .. } => EEXIST,
            Error::NotMapped { .. } => EFAULT,
            Error::NotMmio { .. }
            | Error::AddressOutOfRange { .. }
            | Error::InvalidMapping { .. }
            | Error::UnknownCommand { .. } => EINVAL,
            Error::Interrupted => EINTR,
            Error::SvmNotSupported => ENODEV,
        }
    }

    /// Whether the request can simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno() {
        assert_eq!(Error::Interrupted.errno(), EINTR);
        assert_eq!(VcpuExistsSnafu { vm: "vm-1" }.build().errno(), EEXIST);
        assert_eq!(InvalidMappingSnafu { offset: 0x1000u64, length: 4096usize }.build().errno(), EINVAL);
        assert_eq!(UnknownCommandSnafu { command: 0xdeadu32 }.build().errno(), EINVAL);
        assert_eq!(AddressOutOfRangeSnafu { gpa: 1u64 << 48 }.build().errno(), EINVAL);
        assert!(Error::Interrupted.is_retryable());
        assert!(!OutOfMemorySnafu { object: "vmcb" }.build().is_retryable());
    }

    #[test]
    fn test_display() {
        let error = AlreadyMappedSnafu { gpa: 0xfffff000u64 }.build();
        assert_eq!(format!("{}", error), "Guest physical address 0xfffff000 is already mapped");
    }
}
