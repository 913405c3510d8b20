use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PRIMARY_DB: &str = "./intake.sqlite3";
pub const DEFAULT_FALLBACK_LOG: &str = "./fallback_complaints.json";
pub const FALLBACK_LOG_ENV: &str = "FALLBACK_JSON_PATH";

/// Runtime settings shared by the service and the CLI.
///
/// Loaded from YAML. Every key is optional; missing keys take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    pub primary_db: PathBuf,
    pub fallback_log: PathBuf,
    pub busy_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Seconds between background reconciliation runs. `0` disables the timer.
    pub reconcile_interval_secs: u64,
    pub admin_token: Option<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            primary_db: PathBuf::from(DEFAULT_PRIMARY_DB),
            fallback_log: PathBuf::from(DEFAULT_FALLBACK_LOG),
            busy_timeout_ms: 5_000,
            probe_interval_ms: 5_000,
            reconcile_interval_secs: 60,
            admin_token: None,
        }
    }
}

impl IntakeConfig {
    /// Reads `path` when given, otherwise starts from defaults. `FALLBACK_JSON_PATH` overrides the
    /// fallback log location in both cases.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML for this shape.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str::<Self>(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Some(raw) = std::env::var_os(FALLBACK_LOG_ENV).filter(|raw| !raw.is_empty()) {
            config.fallback_log = PathBuf::from(raw);
        }
        Ok(config)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}
