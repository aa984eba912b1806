use std::io::Write;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

/// Flush when this many lines are queued.
const FLUSH_QD_LINES_THRESHOLD: usize = 10_000;

static SHADOW_LOGGER: Lazy<ShadowLogger> = Lazy::new(ShadowLogger::new);

/// Initialize the logger. The maximum level is fixed for the rest of the run.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    SHADOW_LOGGER.set_max_level(max_log_level);
    SHADOW_LOGGER.set_log_errors_to_stderr(log_errors_to_stderr);

    log::set_logger(&*SHADOW_LOGGER)?;

    // The logger decides for itself which records to show (see `ShadowLogger::enabled`), but we
    // can still let the log crate skip formatting records that will never be shown.
    log::set_max_level(max_log_level);

    // Arrange to flush the logger on panic.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        SHADOW_LOGGER.flush_records().ok();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// Initialize the logger from the run's configuration.
pub fn init_from_config(
    config: &crate::core::configuration::ConfigOptions,
) -> Result<(), SetLoggerError> {
    init(
        config.log_level(),
        config.general.log_errors_to_stderr.unwrap_or(true),
    )
}

/// A logger that attaches thread and wall-clock context to log entries.
///
/// Records are queued and written out in batches, or immediately when buffering is disabled or
/// when an error is logged.
pub struct ShadowLogger {
    // A lock-free queue for individual log records.
    records: ArrayQueue<ShadowLogRecord>,

    // When false, records are written as soon as they're logged.
    buffering_enabled: RwLock<bool>,

    max_log_level: OnceCell<LevelFilter>,

    // Whether to log errors to stderr in addition to stdout.
    log_errors_to_stderr: OnceCell<bool>,

    start_time: Instant,
}

thread_local!(static THREAD_NAME: String = get_thread_name());
thread_local!(static THREAD_ID: i32 = rustix::thread::gettid().as_raw_nonzero().get());

fn get_thread_name() -> String {
    std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_default()
}

impl ShadowLogger {
    fn new() -> ShadowLogger {
        ShadowLogger {
            records: ArrayQueue::new(FLUSH_QD_LINES_THRESHOLD),
            buffering_enabled: RwLock::new(false),
            max_log_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
            start_time: Instant::now(),
        }
    }

    // Write out the records that are already in the queue.
    fn flush_records(&self) -> std::io::Result<()> {
        // only flush records that are already in the queue, not ones that arrive while we're
        // flushing
        let mut toflush = self.records.len();

        let stdout_unlocked = std::io::stdout();
        let stdout_locked = stdout_unlocked.lock();
        let mut stdout = std::io::BufWriter::new(stdout_locked);

        let log_errors_to_stderr = self.log_errors_to_stderr.get().copied().unwrap_or(false);

        while toflush > 0 {
            let Some(record) = self.records.pop() else {
                // another thread is also flushing
                break;
            };
            toflush -= 1;

            if record.level <= Level::Error && log_errors_to_stderr {
                let line = format!("{record}");
                write!(stdout, "{line}")?;
                write!(std::io::stderr().lock(), "{line}")?;
            } else {
                write!(stdout, "{record}")?;
            }
        }

        stdout.flush()
    }

    /// When disabled, each record is written as soon as it's created.
    pub fn set_buffering_enabled(&self, buffering_enabled: bool) {
        let mut writer = self
            .buffering_enabled
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *writer = buffering_enabled;
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_max_level(&self, level: LevelFilter) {
        self.max_log_level.set(level).unwrap()
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_log_errors_to_stderr(&self, val: bool) {
        self.log_errors_to_stderr.set(val).unwrap()
    }

    fn buffering_enabled(&self) -> bool {
        *self
            .buffering_enabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Log for ShadowLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut shadowrecord = ShadowLogRecord {
            level: record.level(),
            file: record.file_static(),
            module_path: record.module_path_static(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: self.start_time.elapsed(),
            thread_name: THREAD_NAME
                .try_with(|name| (*name).clone())
                .unwrap_or_else(|_| get_thread_name()),
            thread_id: THREAD_ID.try_with(|id| *id).unwrap_or(0),
        };

        loop {
            match self.records.push(shadowrecord) {
                Ok(()) => break,
                Err(r) => {
                    // queue is full; flush it and try again
                    shadowrecord = r;
                    self.flush_records().ok();
                }
            }
        }

        if record.level() == Level::Error || !self.buffering_enabled() {
            self.flush_records().ok();
        }
    }

    fn flush(&self) {
        self.flush_records().ok();
    }
}

struct ShadowLogRecord {
    level: Level,
    file: Option<&'static str>,
    module_path: Option<&'static str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,
    thread_name: String,
    thread_id: i32,
}

impl std::fmt::Display for ShadowLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.wall_time.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.wall_time.subsec_micros()
        )?;
        write!(f, " [{}:{}]", self.thread_id, self.thread_name)?;
        write!(f, " [{level}]", level = self.level)?;
        write!(
            f,
            " [{file}:",
            file = self
                .file
                .map(|f| if let Some(sep_pos) = f.rfind('/') {
                    &f[(sep_pos + 1)..]
                } else {
                    f
                })
                .unwrap_or("n/a"),
        )?;
        if let Some(line) = self.line {
            write!(f, "{line}")?;
        } else {
            write!(f, "n/a")?;
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}

pub fn set_buffering_enabled(buffering_enabled: bool) {
    SHADOW_LOGGER.set_buffering_enabled(buffering_enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let record = ShadowLogRecord {
            level: Level::Warn,
            file: Some("src/host/descriptor/epoll/mod.rs"),
            module_path: Some("shadow_epoll::host::descriptor::epoll"),
            line: Some(42),
            message: "hello".to_string(),
            wall_time: Duration::from_millis(3_723_004),
            thread_name: "worker-0".to_string(),
            thread_id: 1234,
        };

        assert_eq!(
            record.to_string(),
            "01:02:03.004000 [1234:worker-0] [WARN] [mod.rs:42] \
             [shadow_epoll::host::descriptor::epoll] hello\n"
        );
    }

    #[test]
    fn test_unset_max_level() {
        let logger = ShadowLogger::new();
        assert_eq!(logger.max_level(), LevelFilter::Trace);
        logger.set_max_level(LevelFilter::Warn);
        assert_eq!(logger.max_level(), LevelFilter::Warn);
        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
    }
}
