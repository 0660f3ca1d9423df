use crate::debugcon::DebugconSink;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing to the debug console.
///
/// Filtering is done by the facade's global maximum level, set in
/// [`init`](Self::init).
pub struct QemuLogger {
    _private: (),
}

impl Default for QemuLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuLogger {
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Installs this logger. Call once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed before.
    pub fn init(&'static self, level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _ = write_record(&mut DebugconSink, record);
    }

    fn flush(&self) {}
}

/// Formats one record as `[LEVEL] target: message\n`.
///
/// # Errors
/// Propagates errors of the underlying writer.
pub fn write_record<W: fmt::Write>(out: &mut W, record: &Record) -> fmt::Result {
    writeln!(out, "[{:<5}] {}: {}", record.level(), record.target(), record.args())
}
