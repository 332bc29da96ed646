//! Various coral-wide constants.

//------------ Application --------------------------------------------------

/// The friendly name of the engine, used in logging.
pub const CORAL_SERVER_APP: &str = "Coral";

/// The default path to the coral config file.
pub const CORAL_DEFAULT_CONFIG_FILE: &str = "/etc/coral.conf";

//------------ Scheduling defaults ------------------------------------------

/// How often a full reconciliation cycle is queued for every CA, in seconds.
pub const SCHEDULER_CRON_PERIOD_SECONDS: i64 = 600;

/// How long a task may run before it should consider yielding, in seconds.
pub const SCHEDULER_TASK_TIMESLICE_SECONDS: i64 = 15;

/// The margin before expiry at which child certificates are reissued
/// pro-actively, in seconds. Two weeks.
pub const CHILD_REGEN_MARGIN_SECONDS: i64 = 14 * 24 * 3600;

/// How long a CRL (and the manifest issued with it) remains current,
/// in seconds.
pub const CRL_INTERVAL_SECONDS: i64 = 24 * 3600;

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is "info".
pub const CORAL_ENV_LOG_LEVEL: &str = "CORAL_LOG_LEVEL";
