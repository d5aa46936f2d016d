use std::{fmt, sync::OnceLock, thread, time::Instant};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct Logger {
    start: Instant,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = self.start.elapsed();
        let thread = thread::current();
        let name = thread.name().unwrap_or("?");
        println!("{now:?} [{name}] {} {}", LevelFormat(record.level()), record.args());
    }

    fn flush(&self) {}
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        write!(f, "\x1B[{color};1m{:>5}\x1B[0m", self.0)
    }
}

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    static LOGGER: OnceLock<Logger> = OnceLock::new();

    let logger = LOGGER.get_or_init(|| Logger {
        start: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
