//! Sync engine configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{AppError, Result};

const KEYRING_SERVICE: &str = "tasksync";
const TOKEN_KEYRING_KEY: &str = "api_token";
const TOKEN_ENV_KEY: &str = "TASKSYNC_API_TOKEN";

/// Queue draining behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncSettings {
    /// Maximum items dequeued per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Send attempts before an item is finalized as `Failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Period of the background sync trigger.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

/// What happens to buffered edits and uncommitted deletes at teardown.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Cancel timers and drop buffered work (logged as a warning).
    #[default]
    Discard,
    /// Commit buffered updates and pending deletes before shutting down.
    Flush,
}

/// Debounce and undo timer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimerSettings {
    /// Quiet period after the last edit before it is queued.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Delay before a delete is committed.
    #[serde(default = "default_undo_window_ms")]
    pub undo_window_ms: u64,
    /// Teardown behaviour for pending timers.
    #[serde(default)]
    pub teardown: TeardownPolicy,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            undo_window_ms: default_undo_window_ms(),
            teardown: TeardownPolicy::default(),
        }
    }
}

impl TimerSettings {
    /// Debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Undo window as a [`Duration`].
    #[must_use]
    pub fn undo_window(&self) -> Duration {
        Duration::from_millis(self.undo_window_ms)
    }
}

/// Garbage collection for terminal queue items.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetentionSettings {
    /// Hours a `Synced` item is kept before the purge task removes it.
    #[serde(default = "default_synced_retention_hours")]
    pub synced_retention_hours: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            synced_retention_hours: default_synced_retention_hours(),
        }
    }
}

/// Reachability probe settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NetworkSettings {
    /// Seconds between health probes.
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    /// Path appended to `server_url` for the health probe.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval_seconds(),
            probe_path: default_probe_path(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_undo_window_ms() -> u64 {
    5000
}

fn default_synced_retention_hours() -> u32 {
    24
}

fn default_probe_interval_seconds() -> u64 {
    15
}

fn default_probe_path() -> String {
    "/health".into()
}

/// Top-level configuration parsed from `tasksync.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Base URL of the task API.
    pub server_url: String,
    /// `SQLite` database holding the queue and the local cache.
    pub db_path: PathBuf,
    /// Queue draining behaviour.
    #[serde(default)]
    pub sync: SyncSettings,
    /// Debounce and undo timers.
    #[serde(default)]
    pub timers: TimerSettings,
    /// Terminal item retention.
    #[serde(default)]
    pub retention: RetentionSettings,
    /// Reachability probing.
    #[serde(default)]
    pub network: NetworkSettings,
    /// Bearer token for the task API (populated at runtime).
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the API token from OS keychain with env-var fallback.
    ///
    /// A missing token is not an error: the server may not require auth.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain lookup task panics.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.api_token = load_credential(TOKEN_KEYRING_KEY, TOKEN_ENV_KEY).await?;
        Ok(())
    }

    /// Server URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Period of the background sync trigger.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_seconds)
    }

    /// Period of the reachability probe.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.network.probe_interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(AppError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(AppError::Config(
                "sync.batch_size must be greater than zero".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(AppError::Config(
                "sync.max_attempts must be greater than zero".into(),
            ));
        }

        if self.sync.interval_seconds == 0 || self.network.probe_interval_seconds == 0 {
            return Err(AppError::Config(
                "interval settings must be greater than zero".into(),
            ));
        }

        if !self.network.probe_path.starts_with('/') {
            return Err(AppError::Config("network.probe_path must start with '/'".into()));
        }

        Ok(())
    }
}

/// Load a single optional credential from OS keychain with env-var fallback.
pub(crate) async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            debug!(key = keyring_key, ?err, "keychain lookup failed, trying env var");
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
