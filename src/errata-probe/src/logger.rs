// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{LockResult, Mutex};
use std::thread;

use errata::metrics::{IncMetric, SharedIncMetric};
use log::{Log, Metadata, Record};

/// The logger. Writes to stderr unless a log file is set, stdout carries
/// the report.
pub static LOGGER: Logger = Logger::new(LoggerConfiguration {
    target: None,
    format: LogFormat {
        show_level: false,
        show_log_origin: false,
    },
});

/// Errors while installing the logger.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum LoggerInitError {
    /// Failed to open log file {0}: {1}
    OpenLogFile(PathBuf, std::io::Error),
    /// Failed to install the logger: {0}
    SetLogger(#[from] log::SetLoggerError),
}

#[derive(Debug)]
pub struct LogFormat {
    pub show_level: bool,
    pub show_log_origin: bool,
}

#[derive(Debug)]
pub struct LoggerConfiguration {
    pub target: Option<std::fs::File>,
    pub format: LogFormat,
}

#[derive(Debug)]
pub struct Logger {
    config: Mutex<LoggerConfiguration>,
    /// Log lines that could not be written.
    pub missed_log_count: SharedIncMetric,
}

fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // A panic while logging leaves the writer usable.
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Logger {
    pub const fn new(config: LoggerConfiguration) -> Self {
        Logger {
            config: Mutex::new(config),
            missed_log_count: SharedIncMetric::new(),
        }
    }

    /// Installs the logger with the given options.
    ///
    /// With `log_path`, lines are appended to that file instead of stderr.
    pub fn init(
        &'static self,
        level: LevelFilter,
        format: LogFormat,
        log_path: Option<&Path>,
    ) -> Result<(), LoggerInitError> {
        let mut guard = extract_guard(self.config.lock());
        if let Some(path) = log_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| LoggerInitError::OpenLogFile(path.to_path_buf(), err))?;
            guard.target = Some(file);
        }
        guard.format = format;
        // Logging below would deadlock while the guard is held.
        drop(guard);

        log::set_logger(self)?;
        log::set_max_level(level.into());
        Ok(())
    }

    fn format(&self, record: &Record, format: &LogFormat) -> String {
        let thread = thread::current().name().unwrap_or("-").to_string();
        let level = match format.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };

        let origin = match format.show_log_origin {
            true => {
                let file = record.file().unwrap_or("?");
                let line = match record.line() {
                    Some(x) => x.to_string(),
                    None => String::from("?"),
                };
                format!(":{file}:{line}")
            }
            false => String::new(),
        };

        format!(
            "[{}:{thread}{level}{origin}] {}\n",
            env!("CARGO_PKG_NAME"),
            record.args()
        )
    }
}

impl Log for Logger {
    // Filtering is left to `log::max_level`.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = extract_guard(self.config.lock());
        let message = self.format(record, &guard.format);

        let result = match &mut guard.target {
            Some(file) => file.write_all(message.as_bytes()),
            None => std::io::stderr().write_all(message.as_bytes()),
        };
        // Nowhere to report the failure, count it.
        if result.is_err() {
            self.missed_log_count.inc();
        }
    }

    fn flush(&self) {}
}

/// Level filter accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
/// Failed to parse string to level filter: {0}
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_levelfilter_from_str() {
        for (level, level_enum) in [
            ("off", LevelFilter::Off),
            ("TRACE", LevelFilter::Trace),
            ("Debug", LevelFilter::Debug),
            ("info", LevelFilter::Info),
            ("warn", LevelFilter::Warn),
            ("Warning", LevelFilter::Warn),
            ("error", LevelFilter::Error),
        ] {
            assert_eq!(LevelFilter::from_str(level), Ok(level_enum));
        }
        assert_eq!(
            LevelFilter::from_str("bad"),
            Err(LevelFilterFromStrError(String::from("bad")))
        );
        assert_eq!(
            log::LevelFilter::from(LevelFilter::Warn),
            log::LevelFilter::Warn
        );
    }

    fn logger(target: std::fs::File) -> Logger {
        Logger::new(LoggerConfiguration {
            target: Some(target),
            format: LogFormat {
                show_level: true,
                show_log_origin: true,
            },
        })
    }

    fn warn_record(f: impl FnOnce(&Record)) {
        let metadata = Metadata::builder().level(Level::Warn).build();
        f(&Record::builder()
            .args(format_args!("CPU3: no conduit"))
            .metadata(metadata)
            .file(Some("src/ssbd.rs"))
            .line(Some(42))
            .build());
    }

    #[test]
    fn test_logger() {
        let file = TempFile::new().unwrap();
        let path = file.as_path().to_path_buf();
        let target = OpenOptions::new().write(true).open(&path).unwrap();

        let logger = logger(target);
        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).build()));

        warn_record(|record| logger.log(record));
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        let thread = thread::current().name().unwrap_or("-").to_string();
        assert_eq!(
            contents,
            format!("[errata-probe:{thread}:WARN:src/ssbd.rs:42] CPU3: no conduit\n")
        );
        assert_eq!(logger.missed_log_count.count(), 0);
    }

    #[test]
    fn test_failed_write_is_counted() {
        let file = TempFile::new().unwrap();
        // Read only, every write fails.
        let target = std::fs::File::open(file.as_path()).unwrap();

        let logger = logger(target);
        warn_record(|record| logger.log(record));
        warn_record(|record| logger.log(record));
        assert_eq!(logger.missed_log_count.count(), 2);
    }

    #[test]
    fn test_init_with_bad_log_path() {
        static BAD_PATH_LOGGER: Logger = Logger::new(LoggerConfiguration {
            target: None,
            format: LogFormat {
                show_level: false,
                show_log_origin: false,
            },
        });
        let dir = vmm_sys_util::tempdir::TempDir::new().unwrap();
        let path = dir.as_path().join("missing").join("probe.log");

        let err = BAD_PATH_LOGGER
            .init(
                LevelFilter::Info,
                LogFormat {
                    show_level: false,
                    show_log_origin: false,
                },
                Some(&path),
            )
            .unwrap_err();
        assert!(matches!(err, LoggerInitError::OpenLogFile(p, _) if p == path));
    }
}
