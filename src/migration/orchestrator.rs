//! One migration pass over every eligible conversation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::phase_runner::{MigrationError, MigrationPhase, MigrationPhaseRunner, PhaseOutcome};
use crate::core::{
    ConversationId, ConversationStore, GroupEstablishment, NotificationSink, Protocol,
    UserDirectory,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationFailure {
    pub conversation: ConversationId,
    pub phase: MigrationPhase,
    pub error: String,
}

/// Summary of one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Conversations moved from legacy to transitional.
    pub upgraded: Vec<ConversationId>,
    pub groups_created: Vec<ConversationId>,
    pub groups_joined: Vec<ConversationId>,
    /// Conversations that had members added, with the number of users added.
    pub members_added: Vec<(ConversationId, usize)>,
    /// Conversations moved from transitional to secure.
    pub finalised: Vec<ConversationId>,
    pub failed: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, id: &ConversationId, outcome: PhaseOutcome) {
        if outcome.upgraded {
            self.upgraded.push(id.clone());
        }
        match outcome.establishment {
            Some(GroupEstablishment::Created) => self.groups_created.push(id.clone()),
            Some(GroupEstablishment::Joined) => self.groups_joined.push(id.clone()),
            None => {}
        }
        if outcome.members_added > 0 {
            self.members_added.push((id.clone(), outcome.members_added));
        }
        if outcome.finalised {
            self.finalised.push(id.clone());
        }
    }
}

/// Something the scheduler can run once per period.
#[async_trait]
pub trait MigrationPass: Send + Sync {
    /// Run a pass. Returns `None` if a previous pass is still running.
    async fn run_pass(&self) -> Option<MigrationReport>;
}

pub struct MigrationOrchestrator {
    runner: Arc<MigrationPhaseRunner>,
    conversations: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    sink: Arc<dyn NotificationSink>,
    running: AtomicBool,
    /// Consecutive failed passes per conversation.
    failures: Mutex<HashMap<ConversationId, u32>>,
    retry_exhaustion_threshold: Option<u32>,
}

impl MigrationOrchestrator {
    pub fn new(
        runner: Arc<MigrationPhaseRunner>,
        conversations: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            runner,
            conversations,
            directory,
            sink,
            running: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            retry_exhaustion_threshold: None,
        }
    }

    /// Alert the sink once a conversation has failed `threshold` passes in a row.
    pub fn with_retry_exhaustion_threshold(mut self, threshold: Option<u32>) -> Self {
        self.retry_exhaustion_threshold = threshold.filter(|t| *t > 0);
        self
    }

    pub async fn consecutive_failures(&self, id: &ConversationId) -> u32 {
        self.failures.lock().await.get(id).copied().unwrap_or(0)
    }

    async fn pass(&self) -> MigrationReport {
        let mut report = MigrationReport::default();

        // Protocol support of peers decides what the backend accepts below.
        if let Err(e) = self.directory.refresh_known_users().await {
            warn!("[migration_pass]: Failed to refresh known users: {e}");
        }

        // Each step re-queries the store: the previous one changed protocols.
        let legacy = self.select("initialise", Protocol::Legacy, true).await;
        info!(
            "[migration_pass]: Initialising migration of {} legacy conversation(s)",
            legacy.len()
        );
        for id in legacy {
            let result = self.runner.initialise(&id).await;
            self.settle(&id, result, &mut report);
        }

        let transitional = self
            .select("join_unestablished", Protocol::Transitional, false)
            .await;
        for id in transitional {
            let result = self.runner.join_unestablished(&id).await;
            self.settle(&id, result, &mut report);
        }

        let transitional = self.select("finalise", Protocol::Transitional, false).await;
        info!(
            "[migration_pass]: Checking {} transitional conversation(s) for finalisation",
            transitional.len()
        );
        for id in transitional {
            let result = self.runner.finalise_transitional(&id, Utc::now()).await;
            self.settle(&id, result, &mut report);
        }

        self.update_failure_counts(&report).await;
        report
    }

    /// Ids of group conversations currently on `protocol`.
    async fn select(&self, step: &str, protocol: Protocol, team_only: bool) -> Vec<ConversationId> {
        let conversations = if team_only {
            self.conversations.self_team_group_conversations().await
        } else {
            self.conversations.group_conversations().await
        };

        match conversations {
            Ok(conversations) => conversations
                .into_iter()
                .filter(|c| c.is_group() && c.protocol == protocol)
                .map(|c| c.id)
                .collect(),
            Err(e) => {
                error!("[migration_pass]: Failed to list conversations for {step}: {e}");
                Vec::new()
            }
        }
    }

    fn settle(
        &self,
        id: &ConversationId,
        result: Result<PhaseOutcome, MigrationError>,
        report: &mut MigrationReport,
    ) {
        match result {
            Ok(outcome) => report.record(id, outcome),
            Err(e) => {
                error!(
                    "[migration_pass]: Migration of conversation {id} failed at {}: {e}",
                    e.phase()
                );
                report.failed.push(MigrationFailure {
                    conversation: id.clone(),
                    phase: e.phase(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn update_failure_counts(&self, report: &MigrationReport) {
        // A conversation can fail in more than one step of the same pass.
        let failed: HashSet<&ConversationId> =
            report.failed.iter().map(|f| &f.conversation).collect();

        let mut failures = self.failures.lock().await;
        failures.retain(|id, _| failed.contains(id));

        let mut exhausted = Vec::new();
        for id in failed {
            let count = failures.entry(id.clone()).or_insert(0);
            *count += 1;
            if self.retry_exhaustion_threshold == Some(*count) {
                exhausted.push((id.clone(), *count));
            }
        }
        drop(failures);

        for (id, count) in exhausted {
            warn!("[migration_pass]: Conversation {id} failed {count} consecutive migration passes");
            self.sink.on_migration_retries_exhausted(&id, count).await;
        }
    }
}

#[async_trait]
impl MigrationPass for MigrationOrchestrator {
    async fn run_pass(&self) -> Option<MigrationReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[migration_pass]: Previous pass still running, skipping");
            return None;
        }
        let _running = RunningGuard(&self.running);

        info!("[migration_pass]: Starting migration pass");
        let report = self.pass().await;
        info!(
            "[migration_pass]: Pass done: {} upgraded, {} created, {} joined, {} finalised, {} failed",
            report.upgraded.len(),
            report.groups_created.len(),
            report.groups_joined.len(),
            report.finalised.len(),
            report.failed.len()
        );
        Some(report)
    }
}

/// Clears the running flag when the pass ends, including on panic or cancellation.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
