//! Daemon logger.
//!
//! Errors go to stderr, everything else to stdout, with the log target
//! highlighted so p2p noise is easy to filter.
use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR".red(),
            Level::Warn => "WARN".yellow(),
            Level::Info => "INFO".green(),
            Level::Debug => "DEBUG".white(),
            Level::Trace => "TRACE".white().dimmed(),
        };
        let target = if record.target().is_empty() {
            record.module_path().unwrap_or_default()
        } else {
            record.target()
        };
        let line = format!(
            "{} {:<5} {} {}",
            Local::now()
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .white(),
            level,
            target.bold(),
            record.args()
        );

        if record.level() == Level::Error {
            writeln!(io::stderr(), "{}", line).ok();
        } else {
            writeln!(io::stdout(), "{}", line).ok();
        }
    }

    fn flush(&self) {}
}

/// Initialize the logger.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    let logger = Logger { level };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}
