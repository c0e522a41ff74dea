//! Engine configuration.
//!
//! Defaults cover every field. [`EngineConfig::from_env`] starts from an optional JSON file
//! (`MLS_TRUST_CONFIG`) and applies `MLS_TRUST_*` overrides on top.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use identity_certs::DEFAULT_EXPIRY_WARNING_DAYS;

use crate::migration::{DEFAULT_MIGRATION_INTERVAL, DEFAULT_PHASE_TIMEOUT};
use crate::verification::{DEFAULT_CHECK_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_IDLE};

pub const CONFIG_FILE_VAR: &str = "MLS_TRUST_CONFIG";

/// Largest accepted expiry warning window (ten years).
pub const MAX_EXPIRY_WARNING_DAYS: i64 = 3650;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub verification: VerificationConfig,
    pub migration: MigrationConfig,
    pub monitor: MonitorConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Notify again when a verified conversation stays verified at a new epoch.
    pub renotify_on_reverify: bool,
    /// Certificates expiring within this many days are reported as expiring soon.
    pub expiry_warning_days: i64,
    /// Bound on each external call made while checking a conversation.
    pub check_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            renotify_on_reverify: false,
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            check_timeout_secs: DEFAULT_CHECK_TIMEOUT.as_secs(),
        }
    }
}

impl VerificationConfig {
    pub fn expiry_warning(&self) -> chrono::Duration {
        chrono::Duration::days(self.expiry_warning_days.clamp(0, MAX_EXPIRY_WARNING_DAYS))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub interval_secs: u64,
    /// Bound on each external call of a migration phase.
    pub phase_timeout_secs: u64,
    /// Consecutive failed passes after which the sink is alerted. `None` only logs.
    pub retry_exhaustion_threshold: Option<u32>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_MIGRATION_INTERVAL.as_secs(),
            phase_timeout_secs: DEFAULT_PHASE_TIMEOUT.as_secs(),
            retry_exhaustion_threshold: None,
        }
    }
}

impl MigrationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub queue_capacity: usize,
    /// A group worker with no events for this long is released.
    pub worker_idle_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_idle_secs: DEFAULT_WORKER_IDLE.as_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs)
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from the process environment.
    ///
    /// - `MLS_TRUST_CONFIG`: path to a JSON config file (optional)
    /// - `MLS_TRUST_RENOTIFY_ON_REVERIFY`, `MLS_TRUST_EXPIRY_WARNING_DAYS`,
    ///   `MLS_TRUST_CHECK_TIMEOUT_SECS`
    /// - `MLS_TRUST_MIGRATION_INTERVAL_SECS`, `MLS_TRUST_PHASE_TIMEOUT_SECS`,
    ///   `MLS_TRUST_RETRY_EXHAUSTION_THRESHOLD`
    /// - `MLS_TRUST_QUEUE_CAPACITY`, `MLS_TRUST_WORKER_IDLE_SECS`
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = match lookup(CONFIG_FILE_VAR) {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {path}"))?;
                Self::from_json(&json).with_context(|| format!("Invalid config file {path}"))?
            }
            None => Self::default(),
        };

        override_with(
            &lookup,
            "MLS_TRUST_RENOTIFY_ON_REVERIFY",
            &mut config.verification.renotify_on_reverify,
        )?;
        override_with(
            &lookup,
            "MLS_TRUST_EXPIRY_WARNING_DAYS",
            &mut config.verification.expiry_warning_days,
        )?;
        override_with(
            &lookup,
            "MLS_TRUST_CHECK_TIMEOUT_SECS",
            &mut config.verification.check_timeout_secs,
        )?;
        override_with(
            &lookup,
            "MLS_TRUST_MIGRATION_INTERVAL_SECS",
            &mut config.migration.interval_secs,
        )?;
        override_with(
            &lookup,
            "MLS_TRUST_PHASE_TIMEOUT_SECS",
            &mut config.migration.phase_timeout_secs,
        )?;
        if let Some(raw) = lookup("MLS_TRUST_RETRY_EXHAUSTION_THRESHOLD") {
            config.migration.retry_exhaustion_threshold = Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid MLS_TRUST_RETRY_EXHAUSTION_THRESHOLD: {raw}"))?,
            );
        }
        override_with(
            &lookup,
            "MLS_TRUST_QUEUE_CAPACITY",
            &mut config.monitor.queue_capacity,
        )?;
        override_with(
            &lookup,
            "MLS_TRUST_WORKER_IDLE_SECS",
            &mut config.monitor.worker_idle_secs,
        )?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.migration.interval_secs > 0,
            "migration.interval_secs must be positive"
        );
        anyhow::ensure!(
            self.migration.phase_timeout_secs > 0,
            "migration.phase_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.monitor.queue_capacity > 0,
            "monitor.queue_capacity must be positive"
        );
        anyhow::ensure!(
            (0..=MAX_EXPIRY_WARNING_DAYS).contains(&self.verification.expiry_warning_days),
            "verification.expiry_warning_days must be between 0 and {MAX_EXPIRY_WARNING_DAYS}"
        );
        anyhow::ensure!(
            self.verification.check_timeout_secs > 0,
            "verification.check_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.monitor.worker_idle_secs > 0,
            "monitor.worker_idle_secs must be positive"
        );
        Ok(())
    }
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw}"))?;
    }
    Ok(())
}
