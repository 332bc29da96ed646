//! Configuration for the engine.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use chrono::Duration;
use log::{error, LevelFilter};
use serde::{de, Deserialize, Deserializer};

use crate::commons::ext_serde;
use crate::constants::{
    CHILD_REGEN_MARGIN_SECONDS, CORAL_ENV_LOG_LEVEL, CRL_INTERVAL_SECONDS,
    SCHEDULER_CRON_PERIOD_SECONDS, SCHEDULER_TASK_TIMESLICE_SECONDS,
};

//------------ ConfigDefaults ------------------------------------------------

struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(CORAL_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {CORAL_ENV_LOG_LEVEL}");
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::File
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./coral.log")
    }

    fn cron_period_seconds() -> i64 {
        SCHEDULER_CRON_PERIOD_SECONDS
    }

    fn task_timeslice_seconds() -> i64 {
        SCHEDULER_TASK_TIMESLICE_SECONDS
    }

    fn child_regen_margin_seconds() -> i64 {
        CHILD_REGEN_MARGIN_SECONDS
    }

    fn crl_interval_seconds() -> i64 {
        CRL_INTERVAL_SECONDS
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the engine.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    /// How often a full reconciliation cycle is queued for every CA.
    #[serde(default = "ConfigDefaults::cron_period_seconds")]
    pub cron_period_seconds: i64,

    /// How long a task should run before considering yielding.
    #[serde(default = "ConfigDefaults::task_timeslice_seconds")]
    pub task_timeslice_seconds: i64,

    /// The margin before expiry at which child certificates are reissued.
    #[serde(default = "ConfigDefaults::child_regen_margin_seconds")]
    pub child_regen_margin_seconds: i64,

    /// How long issued CRLs and manifests remain current.
    #[serde(default = "ConfigDefaults::crl_interval_seconds")]
    pub crl_interval_seconds: i64,
}

impl Config {
    /// Creates a config with defaults for everything.
    pub fn defaults() -> Self {
        Config {
            log_level: ConfigDefaults::log_level(),
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            cron_period_seconds: ConfigDefaults::cron_period_seconds(),
            task_timeslice_seconds: ConfigDefaults::task_timeslice_seconds(),
            child_regen_margin_seconds:
                ConfigDefaults::child_regen_margin_seconds(),
            crl_interval_seconds: ConfigDefaults::crl_interval_seconds(),
        }
    }

    /// Reads the configuration from a TOML file.
    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(file)?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    pub fn cron_period(&self) -> Duration {
        Duration::seconds(self.cron_period_seconds)
    }

    pub fn task_timeslice(&self) -> Duration {
        Duration::seconds(self.task_timeslice_seconds)
    }

    pub fn child_regen_margin(&self) -> Duration {
        Duration::seconds(self.child_regen_margin_seconds)
    }

    pub fn crl_interval(&self) -> Duration {
        Duration::seconds(self.crl_interval_seconds)
    }

    /// The safety window before CRL staleness at which regeneration kicks
    /// in: the greater of twice the cron period or a quarter of the CRL
    /// interval.
    pub fn crl_regen_margin(&self) -> Duration {
        Duration::seconds(
            (2 * self.cron_period_seconds).max(self.crl_interval_seconds / 4),
        )
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger().chain(io::stderr()).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init stderr logging: {e}"))
        })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}",
                    path.display(),
                    err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger().chain(file).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {e}"))
        })
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy dependency logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(format!("unrecognized log type: {s}")),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn read_config_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_type = \"stderr\"\ncron_period_seconds = 120"
        )
        .unwrap();

        let config = Config::read_config(file.path()).unwrap();
        assert_eq!(config.log_type, LogType::Stderr);
        assert_eq!(config.cron_period(), Duration::seconds(120));
        assert_eq!(
            config.task_timeslice(),
            Duration::seconds(SCHEDULER_TASK_TIMESLICE_SECONDS)
        );
    }

    #[test]
    fn crl_regen_margin_is_the_greater_of_the_two() {
        let mut config = Config::defaults();
        config.cron_period_seconds = 600;
        config.crl_interval_seconds = 24 * 3600;
        // a quarter of the CRL interval wins
        assert_eq!(
            config.crl_regen_margin(),
            Duration::seconds(6 * 3600)
        );

        config.cron_period_seconds = 4 * 3600;
        // twice the cron period wins
        assert_eq!(
            config.crl_regen_margin(),
            Duration::seconds(8 * 3600)
        );
    }
}
