//! Logging.
//!
//! The crate logs through the [`log`](https://docs.rs/log/) facade. This
//! module provides [`CordLogger`], a `log::Log` implementation rendering
//! records in the runtime's native line format:
//!
//! ```text
//! 2026-08-01 12:00:00.123 [4242] main/101/worker E> something failed
//! ```
//!
//! that is: timestamp, pid, `cord/fiber-id/fiber-name`, a one-letter level
//! and the message. Records logged outside any cord fall back to the
//! thread name.
//!
//! ```no_run
//! use log::LevelFilter;
//!
//! cordage::log::init(LevelFilter::Info);
//! log::info!("hello");
//! ```

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::cord;
use crate::fiber;

/// `log::Log` implementation writing the runtime's native format to
/// stderr.
#[derive(Default)]
pub struct CordLogger;

impl CordLogger {
    pub const fn new() -> Self {
        Self
    }
}

fn level_letter(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'V',
    }
}

fn context() -> (String, u32, String) {
    if cord::try_cord().is_some() {
        let f = fiber::current();
        (cord::cord_name(), f.id(), f.name())
    } else {
        let name = std::thread::current()
            .name()
            .unwrap_or("thread")
            .to_string();
        (name, 0, String::new())
    }
}

impl Log for CordLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let fmt = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );
        let ts = OffsetDateTime::now_utc()
            .format(&fmt)
            .unwrap_or_else(|_| "-".into());
        let (cord_name, fid, fiber_name) = context();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{ts} [{pid}] {cord_name}/{fid}/{fiber_name} {level}> {args}",
            pid = std::process::id(),
            level = level_letter(record.level()),
            args = record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: CordLogger = CordLogger::new();

/// Install [`CordLogger`] as the global logger with the given level.
/// Does nothing if a logger is already installed.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
