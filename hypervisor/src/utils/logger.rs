use alloc::format;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Forwards log records to the output of the embedding kernel module (printk,
/// serial port, ...).
pub struct KernelLogger {
    sink: fn(&str),
    level: LevelFilter,
}

impl KernelLogger {
    pub const fn new(sink: fn(&str), level: LevelFilter) -> Self {
        Self { sink, level }
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);

        Ok(())
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} - {}\n", record.level(), record.args());

            (self.sink)(&message);
        }
    }

    fn flush(&self) {}
}
