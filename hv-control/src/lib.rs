//! Drives a guest from user space: runs the vcpu, dispatches its exits and
//! emulates the test devices.

use hypervisor::utils::logger::KernelLogger;
use log::{LevelFilter, SetLoggerError};

pub mod devices;
pub mod emulator;
pub mod error;
pub mod handlers;
pub mod mmio;

pub use emulator::{Emulator, EmulatorBuilder, ExitHandler, ExitType, Machine, VmExitType};
pub use error::EmulatorError;

fn stderr(line: &str) {
    eprint!("{}", line);
}

static LOGGER: KernelLogger = KernelLogger::new(stderr, LevelFilter::Trace);

/// Sends log records of the hypervisor and the emulator to stderr.
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.install()?;
    log::set_max_level(level);

    Ok(())
}
