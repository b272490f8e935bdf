//! Kernel logging facility
//!
//! Routes the `log` macros used by the memory subsystems to the serial port.
//! Nothing is installed under `cargo test`, so logging is a no-op there.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serializes whole records so lines from nested calls never interleave.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// The level `init` installs: everything down to `Debug` in debug builds,
/// `Info` and above in release builds.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`]. Must run once, before memory management comes up,
/// so the allocators' diagnostics reach the serial port.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(default_level()))
        .expect("Logger initialization failed");
}
