use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from reprieve.toml.
///
/// Every field is optional in the file; unspecified keys keep their
/// defaults, and a missing file yields the full default configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal number to intercept.
    pub signal: i32,
    /// Minutes to keep working after the signal before checkpointing.
    pub delay_minutes: u64,
    /// Checkpoint artifact filename, for the caller's handler to use.
    pub checkpoint_fn: PathBuf,
    /// Log output target; absent means logging stays disabled.
    pub logfile: Option<PathBuf>,
    pub loglevel: LogLevel,
    /// SMTP relay for operator notifications.
    pub email_server: Option<String>,
    /// Recipient and sender address. Notifications are disabled when
    /// either this or `email_server` is absent.
    pub email_address: Option<String>,
    pub email_types: EmailTypes,
}

/// Which lifecycle points trigger an operator email.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmailTypes {
    pub signal_caught: bool,
    pub checkpoint_handler_done: bool,
}

/// Verbosity for the optional logfile sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal: signal_hook::consts::SIGTERM,
            delay_minutes: 60,
            checkpoint_fn: PathBuf::from("model_checkpoint.pt"),
            logfile: None,
            loglevel: LogLevel::default(),
            email_server: None,
            email_address: None,
            email_types: EmailTypes::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// A missing file silently yields the defaults. Recovery from a bad
    /// file is per-field: a key that fails to deserialize keeps its default
    /// (with a warning) while the rest of the file still applies. Only a
    /// file that is not valid TOML at all falls back to the full defaults.
    /// Configuration problems are never fatal.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };

        match toml::from_str::<toml::Table>(&contents) {
            Ok(table) => Self::from_table(&table),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "unparseable config file, using defaults"
                );
                Self::default()
            }
        }
    }

    fn from_table(table: &toml::Table) -> Self {
        let defaults = Self::default();
        Self {
            signal: field(table, "signal", defaults.signal),
            delay_minutes: field(table, "delay_minutes", defaults.delay_minutes),
            checkpoint_fn: field(table, "checkpoint_fn", defaults.checkpoint_fn),
            logfile: field(table, "logfile", defaults.logfile),
            loglevel: field(table, "loglevel", defaults.loglevel),
            email_server: field(table, "email_server", defaults.email_server),
            email_address: field(table, "email_address", defaults.email_address),
            email_types: match table.get("email_types").and_then(|v| v.as_table()) {
                Some(types) => EmailTypes {
                    signal_caught: field(types, "signal_caught", false),
                    checkpoint_handler_done: field(types, "checkpoint_handler_done", false),
                },
                None => EmailTypes::default(),
            },
        }
    }

    /// The configured grace delay as a duration.
    pub fn grace_delay(&self) -> Duration {
        Duration::from_secs(self.delay_minutes.saturating_mul(60))
    }

    /// Whether both ends of the notification channel are configured.
    pub fn email_configured(&self) -> bool {
        self.email_server.is_some() && self.email_address.is_some()
    }
}

/// Deserialize one config key, keeping `default` when the key is absent or
/// its value fails to deserialize. A bad value never poisons its siblings.
fn field<T: serde::de::DeserializeOwned>(table: &toml::Table, key: &str, default: T) -> T {
    match table.get(key) {
        None => default,
        Some(value) => match value.clone().try_into() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(key, error = %e, "invalid config value, keeping default");
                default
            }
        },
    }
}
