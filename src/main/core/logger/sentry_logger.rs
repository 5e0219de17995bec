//! The supervisor's diagnostic logger.
//!
//! Every record is written to stderr synchronously, one line of the form
//!
//! ```text
//! pidsentry: [00:00:01.084321 1234 monitor.rs:88] message
//! ```
//!
//! where the timestamp is elapsed time since program start. There is no
//! buffering: a supervisor's last words are its most important ones, and they
//! must survive an immediately following crash.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::utility::time::{process_uptime, TimeParts};

static SENTRY_LOGGER: Lazy<SentryLogger> = Lazy::new(SentryLogger::new);

/// Install the logger with the given level filter.
pub fn init(max_log_level: LevelFilter) -> Result<(), SetLoggerError> {
    SENTRY_LOGGER.set_max_level(max_log_level);
    log::set_logger(&*SENTRY_LOGGER)?;
    log::set_max_level(max_log_level);
    Ok(())
}

pub struct SentryLogger {
    max_log_level: OnceCell<LevelFilter>,
}

impl SentryLogger {
    fn new() -> Self {
        Self {
            max_log_level: OnceCell::new(),
        }
    }

    fn set_max_level(&self, level: LevelFilter) {
        self.max_log_level.set(level).unwrap()
    }

    fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Warn)
    }
}

impl Log for SentryLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let elapsed = process_uptime();
        let parts = TimeParts::from_nanos(elapsed.as_nanos());

        // Only the file's base name; the directory adds noise, not identity.
        let file = record
            .file()
            .map(|file| match file.rfind('/') {
                Some(sep) => &file[sep + 1..],
                None => file,
            })
            .unwrap_or("n/a");

        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        let _ = writeln!(
            stderr,
            "pidsentry: [{:02}:{:02}:{:02}.{:06} {} {}:{}] {}",
            parts.hours,
            parts.mins,
            parts.secs,
            parts.nanos / 1000,
            nix::unistd::getpid(),
            file,
            record.line().unwrap_or(0),
            record.args()
        );
        let _ = stderr.flush();

        if record.level() <= Level::Error {
            // Errors precede aborts; make sure nothing is lost.
            let _ = std::io::stderr().lock().flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().lock().flush();
    }
}
