//! `log` facade backend over the serial console.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::console::_print(format_args!(
            "[{}] {}: {}\n",
            tag,
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Route the `log` macros to the serial console.
///
/// Call once during boot, after [`crate::console::init`]. Silently keeps
/// the previous logger if one is already installed.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
