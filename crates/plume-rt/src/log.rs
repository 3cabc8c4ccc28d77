use std::io::Write;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

static INIT: Once = Once::new();
static LOGGER: PlumeLogger = PlumeLogger;

/// Stderr logger switched on by `PLUME_LOG`.
pub struct PlumeLogger;

impl Log for PlumeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "[{level}] {}: {}", record.target(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

pub fn level_from_env() -> LevelFilter {
    match std::env::var("PLUME_LOG").as_deref().map(str::trim) {
        Ok("1") | Ok("info") | Ok("true") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}

/// Installs the logger once per process; later calls only refresh the level.
pub fn init() {
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
    });
    log::set_max_level(level_from_env());
}
