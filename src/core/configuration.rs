//! Configuration for a simulation run, parsed from YAML using [serde].
//!
//! Every option is an `Option` so that a partial configuration can be merged with the defaults
//! (see [`merge::Merge`]). After merging, the accessors on [`ConfigOptions`] can rely on every
//! value being set.

use std::str::FromStr;

use anyhow::Context;
use merge::Merge;
use serde::{Deserialize, Serialize};

use crate::host::process::ProcessOptions;

/// Options contained in a configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    #[serde(default)]
    pub general: GeneralOptions,

    #[serde(default)]
    pub experimental: ExperimentalOptions,
}

/// Configuration options after merging the configuration file with the defaults.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,

    pub experimental: ExperimentalOptions,
}

impl ConfigOptions {
    pub fn new(config_file: ConfigFileOptions) -> Self {
        Self {
            general: config_file.general.with_defaults(GeneralOptions::new_with_defaults()),
            experimental: config_file
                .experimental
                .with_defaults(ExperimentalOptions::new_with_defaults()),
        }
    }

    /// Parse a YAML configuration and fill in unset options with their defaults.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config_file: ConfigFileOptions =
            serde_yaml::from_str(yaml).context("Failed to parse configuration file")?;
        Ok(Self::new(config_file))
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.general
            .log_level
            .map(|x| log::Level::from(x).to_level_filter())
            .unwrap_or(log::LevelFilter::Info)
    }

    /// The options that each process is created with.
    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            use_syscall_counters: self.experimental.use_syscall_counters.unwrap_or(true),
            use_os_epoll_fallback: self.experimental.use_os_epoll_fallback.unwrap_or(true),
            max_descriptors: self.experimental.max_descriptors.unwrap_or(1024),
        }
    }
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self::new(ConfigFileOptions::default())
    }
}

// these must all be Option types so that a partial configuration can be merged with the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, Merge)]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout. If a value isn't given, the level is "info".
    #[serde(default)]
    pub log_level: Option<LogLevel>,

    /// Also write error-level messages to stderr.
    #[serde(default)]
    pub log_errors_to_stderr: Option<bool>,
}

impl GeneralOptions {
    fn new_with_defaults() -> Self {
        Self {
            log_level: Some(LogLevel::Info),
            log_errors_to_stderr: Some(true),
        }
    }

    /// Replace unset (`None`) values of `self` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Merge)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentalOptions {
    /// Count the number of occurrences for individual syscalls.
    pub use_syscall_counters: Option<bool>,

    /// Watch descriptors that have no simulated representation through a real kernel epoll.
    pub use_os_epoll_fallback: Option<bool>,

    /// The maximum number of descriptors a process can have open.
    pub max_descriptors: Option<u32>,
}

impl ExperimentalOptions {
    fn new_with_defaults() -> Self {
        Self {
            use_syscall_counters: Some(true),
            use_os_epoll_fallback: Some(true),
            max_descriptors: Some(1024),
        }
    }

    /// Replace unset (`None`) values of `self` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}
