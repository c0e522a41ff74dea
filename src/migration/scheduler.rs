//! Recurring migration check.
//!
//! Provides a [`RecurringTaskHost`] trait, a default [`TokioTaskHost`] implementation, and the
//! [`MigrationScheduler`] that gates every run on environment, user and policy.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::orchestrator::{MigrationPass, MigrationReport};
use crate::core::{MigrationPolicySource, MigrationStatus, Protocol, UserDirectory};

/// Key the migration check is registered under.
pub const MIGRATION_TASK_KEY: &str = "mls-migration";

/// Default period of the migration check (24 hours).
pub const DEFAULT_MIGRATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub type RecurringTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs tasks periodically.
///
/// Registering a task under a key that is already registered replaces the previous task.
#[async_trait]
pub trait RecurringTaskHost: Send + Sync {
    async fn register_task(&self, key: &str, every: Duration, task: RecurringTask);
}

/// Task host backed by tokio tasks. The first run of a task happens one period after
/// registration; runs of one task never overlap.
#[derive(Default)]
pub struct TokioTaskHost {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTaskHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_registered(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort every registered task.
    pub async fn shutdown(&self) {
        for (key, handle) in self.tasks.lock().await.drain() {
            debug!("[task_host]: Stopping task {key}");
            handle.abort();
        }
    }
}

#[async_trait]
impl RecurringTaskHost for TokioTaskHost {
    async fn register_task(&self, key: &str, every: Duration, task: RecurringTask) {
        if every.is_zero() {
            warn!("[task_host]: Refusing to register task {key} with a zero period");
            return;
        }

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task().await;
            }
        });

        if let Some(previous) = self.tasks.lock().await.insert(key.to_string(), handle) {
            info!("[task_host]: Replacing task {key}");
            previous.abort();
        }
    }
}

/// Decision taken by one run of the migration check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationGate {
    EnvironmentUnsupported,
    /// The self user does not support the secure protocol.
    SelfUnsupported,
    Disabled,
    /// Migration is enabled but its start time has not arrived.
    NotStarted,
    /// The policy could not be read; treated as "no".
    PolicyUnavailable(String),
    /// A previous pass was still running.
    Overlapping,
    Ran(MigrationReport),
}

impl Display for MigrationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationGate::EnvironmentUnsupported => write!(f, "environment unsupported"),
            MigrationGate::SelfUnsupported => write!(f, "self user unsupported"),
            MigrationGate::Disabled => write!(f, "disabled"),
            MigrationGate::NotStarted => write!(f, "not started"),
            MigrationGate::PolicyUnavailable(e) => write!(f, "policy unavailable: {e}"),
            MigrationGate::Overlapping => write!(f, "overlapping"),
            MigrationGate::Ran(report) => write!(f, "ran ({} failed)", report.failed.len()),
        }
    }
}

pub struct MigrationScheduler {
    policy: Arc<dyn MigrationPolicySource>,
    directory: Arc<dyn UserDirectory>,
    pass: Arc<dyn MigrationPass>,
    interval: Duration,
}

impl MigrationScheduler {
    pub fn new(
        policy: Arc<dyn MigrationPolicySource>,
        directory: Arc<dyn UserDirectory>,
        pass: Arc<dyn MigrationPass>,
    ) -> Self {
        Self {
            policy,
            directory,
            pass,
            interval: DEFAULT_MIGRATION_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check once now, then register the recurring check with `host`.
    pub async fn activate(self: Arc<Self>, host: &dyn RecurringTaskHost) -> MigrationGate {
        let gate = self.check_and_run().await;

        let scheduler = self.clone();
        let task: RecurringTask = Arc::new(move || {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.check_and_run().await;
            })
        });
        host.register_task(MIGRATION_TASK_KEY, self.interval, task).await;
        info!(
            "[migration_scheduler]: Migration check registered every {:?}",
            self.interval
        );
        gate
    }

    /// Run the gate chain and, if every gate passes, one migration pass.
    pub async fn check_and_run(&self) -> MigrationGate {
        if let Some(gate) = self.gate().await {
            return gate;
        }

        info!("[migration_scheduler]: Migration start time has arrived, migrating conversations");
        match self.pass.run_pass().await {
            Some(report) => MigrationGate::Ran(report),
            None => MigrationGate::Overlapping,
        }
    }

    /// `Some` with the reason to stop, `None` when the pass may run.
    async fn gate(&self) -> Option<MigrationGate> {
        if !self.policy.is_secure_protocol_supported_by_environment().await {
            debug!("[migration_scheduler]: Secure protocol not supported by environment");
            return Some(MigrationGate::EnvironmentUnsupported);
        }

        let self_user = self.directory.self_user();
        match self.policy.supported_protocols(&self_user).await {
            Ok(protocols) if protocols.contains(&Protocol::Secure) => {}
            Ok(_) => {
                debug!("[migration_scheduler]: Secure protocol not supported by {self_user}");
                return Some(MigrationGate::SelfUnsupported);
            }
            Err(e) => {
                warn!("[migration_scheduler]: Failed to read supported protocols: {e}");
                return Some(MigrationGate::PolicyUnavailable(e.to_string()));
            }
        }

        match self.policy.migration_status().await {
            Ok(MigrationStatus::Disabled) => {
                info!(
                    "[migration_scheduler]: Migration is disabled, will check again in {:?}",
                    self.interval
                );
                Some(MigrationGate::Disabled)
            }
            Ok(MigrationStatus::NotStarted) => {
                info!(
                    "[migration_scheduler]: Migration start time has not arrived, will check again in {:?}",
                    self.interval
                );
                Some(MigrationGate::NotStarted)
            }
            Ok(MigrationStatus::Started) => None,
            Err(e) => {
                warn!("[migration_scheduler]: Failed to read migration status: {e}");
                Some(MigrationGate::PolicyUnavailable(e.to_string()))
            }
        }
    }
}
