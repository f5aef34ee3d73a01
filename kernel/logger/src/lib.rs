//! A basic logger implementation for system-wide logging.
//!
//! This enables kernel crates to use the `log` crate's macros anywhere.
//! Log statements are written to whatever sink the bootstrapping code
//! hands to [`init()`], typically a serial port.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;
use sync_irq::IrqSafeMutex;


/// The output channel log lines are written to.
pub type LogSink = Box<dyn Write + Send>;

/// Writes every enabled record as one `"<LEVEL> - <message>"` line.
pub struct SinkLogger {
    sink: IrqSafeMutex<LogSink>,
    level: LevelFilter,
}

impl SinkLogger {
    pub fn new(level: LevelFilter, sink: LogSink) -> SinkLogger {
        SinkLogger { sink: IrqSafeMutex::new(sink), level }
    }
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink.lock();
        // result is discarded because we
        // have no alternative way to signal
        // an issue to the user
        let _ = write!(sink, "{} - {}\r\n", record.level(), record.args());
    }

    fn flush(&self) {}
}

// Global logger Singleton
static LOGGER: Once<SinkLogger> = Once::new();

/// Initializes the global logger singleton and sets it as the system-wide
/// logger for the `log` crate.
///
/// Bootstrapping code must call this as early as possible for all log
/// messages to show up. Only the first call succeeds.
pub fn init(level: LevelFilter, sink: LogSink) -> Result<(), &'static str> {
    let mut sink = Some(sink);
    let mut installed_now = false;
    let logger = LOGGER.call_once(|| {
        installed_now = true;
        // `call_once` runs this closure at most once, so the sink is always present here.
        SinkLogger::new(level, sink.take().unwrap_or_else(|| Box::new(NullSink)))
    });
    if !installed_now {
        return Err("logger: the system logger was already initialized");
    }

    log::set_logger(logger).map_err(|_| "logger: couldn't set logger")?;
    log::set_max_level(level);
    Ok(())
}

/// Swallows everything written to it.
struct NullSink;

impl Write for NullSink {
    fn write_str(&mut self, _s: &str) -> core::fmt::Result {
        Ok(())
    }
}
