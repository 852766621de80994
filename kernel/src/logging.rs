//! Kernel logging facility
//!
//! Provides thread-safe logging for the kernel using the `log` crate. Output
//! goes to a sink installed at boot, normally the serial console.
//! Log levels are configured based on build configuration (debug/release).

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Where formatted log lines are written.
pub type Sink = fn(fmt::Arguments);

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    sink: Mutex<Option<Sink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a logger with no sink; records are dropped until one is set
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: Sink) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for Logger {
    /// Returns true if the message level is less than or equal to the maximum configured level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let sink = self.sink.lock();
            if let Some(write) = *sink {
                write(format_args!("[{}] {}\n", record.level(), record.args()));
            }
        }
    }

    fn flush(&self) {}
}

/// Initializes the logging system
///
/// # Arguments
/// * `cpu_id` - CPU core identifier. Only core 0 will initialize the logger
/// * `sink` - Output for formatted records
///
/// # Notes
/// * Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init(cpu_id: u32, sink: Sink) -> Result<(), log::SetLoggerError> {
    if cpu_id != 0 {
        return Ok(());
    }

    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(
        #[cfg(debug_assertions)]
        LevelFilter::Debug,
        #[cfg(not(debug_assertions))]
        LevelFilter::Info,
    );
    Ok(())
}

/// Convenience macro for trace-level logging
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => (log::trace!($($arg)*));
}

/// Convenience macro for debug-level logging
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (log::debug!($($arg)*));
}

/// Convenience macro for info-level logging
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (log::info!($($arg)*));
}

/// Convenience macro for warning-level logging
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => (log::warn!($($arg)*));
}

/// Convenience macro for error-level logging
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => (log::error!($($arg)*));
}
