use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Hypervisor(#[from] hypervisor::Error),

    #[error("no handler for exit code {code:#x} at {rip:#x}")]
    UnhandledExit { code: u64, rip: u64 },

    #[error("cannot emulate the mmio access at {rip:#x}")]
    UndecodableMmio { rip: u64 },

    #[error("access to {gpa:#x}, which belongs to no device")]
    UnexpectedMmio { gpa: u64 },

    #[error("access to port {port:#x}, which belongs to no device")]
    UnexpectedPort { port: u16 },

    #[error("{size} byte port access, only single bytes are supported")]
    UnsupportedPortSize { size: usize },

    #[error("protection fault on present guest page {gpa:#x}")]
    ProtectionFault { gpa: u64 },
}

pub type Result<T, E = EmulatorError> = std::result::Result<T, E>;
