//! Integration tests for the migration phase runner and orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use uuid::Uuid;

use mls_trust::core::{
    Conversation, ConversationId, ConversationKind, ConversationLocks, GroupEstablishment,
    GroupId, GroupLifecycleService, MigrationStatus, Protocol, ProtocolStore, QualifiedId,
    ServiceError, UserId, VerificationState,
};
use mls_trust::memory::{InMemoryBackend, RecordingNotificationSink};
use mls_trust::migration::{
    MigrationError, MigrationOrchestrator, MigrationPass, MigrationPhase, MigrationPhaseRunner,
};

// ─────────────────────────── Test doubles ───────────────────────────

#[derive(Clone, Copy)]
enum Rejection {
    /// The call fails.
    Error,
    /// The call succeeds but the stored record is left unchanged.
    Ignore,
}

/// Protocol store that can refuse updates for selected conversations.
struct ScriptedProtocolStore {
    inner: Arc<InMemoryBackend>,
    rejections: Mutex<HashMap<ConversationId, Rejection>>,
}

impl ScriptedProtocolStore {
    fn reject(&self, id: &ConversationId, rejection: Rejection) {
        self.rejections.lock().unwrap().insert(id.clone(), rejection);
    }

    fn accept(&self, id: &ConversationId) {
        self.rejections.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl ProtocolStore for ScriptedProtocolStore {
    async fn update_protocol(
        &self,
        conversation: &Conversation,
        target: Protocol,
    ) -> Result<Conversation, ServiceError> {
        let rejection = self.rejections.lock().unwrap().get(&conversation.id).copied();
        match rejection {
            Some(Rejection::Error) => Err(ServiceError::Rejected("upgrade refused".into())),
            Some(Rejection::Ignore) => Ok(conversation.clone()),
            None => self.inner.update_protocol(conversation, target).await,
        }
    }
}

/// Group service that counts calls and can be slowed down.
struct CountingGroups {
    inner: Arc<InMemoryBackend>,
    establish_calls: AtomicUsize,
    add_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl CountingGroups {
    fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn maybe_sleep(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GroupLifecycleService for CountingGroups {
    async fn is_member(&self, group_id: &GroupId) -> Result<bool, ServiceError> {
        self.inner.is_member(group_id).await
    }

    async fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, ServiceError> {
        self.inner.group_members(group_id).await
    }

    async fn establish_or_join_group(
        &self,
        conversation: &Conversation,
    ) -> Result<GroupEstablishment, ServiceError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_sleep().await;
        self.inner.establish_or_join_group(conversation).await
    }

    async fn add_members(
        &self,
        conversation: &Conversation,
        members: &[UserId],
    ) -> Result<(), ServiceError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.add_members(conversation, members).await
    }
}

// ─────────────────────────── Fixture ───────────────────────────

struct Fixture {
    backend: Arc<InMemoryBackend>,
    protocols: Arc<ScriptedProtocolStore>,
    groups: Arc<CountingGroups>,
    sink: Arc<RecordingNotificationSink>,
    runner: Arc<MigrationPhaseRunner>,
    team: Uuid,
    alice: UserId,
    bob: UserId,
}

impl Fixture {
    fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    fn with_timeout(timeout: Duration) -> Self {
        let alice = UserId(QualifiedId::random("example.com"));
        let bob = UserId(QualifiedId::random("example.com"));
        let team = Uuid::new_v4();

        let backend = Arc::new(InMemoryBackend::new(alice.clone(), None));
        backend.set_self_team(team).unwrap();
        backend.set_migration_status(MigrationStatus::Started).unwrap();

        let protocols = Arc::new(ScriptedProtocolStore {
            inner: backend.clone(),
            rejections: Mutex::new(HashMap::new()),
        });
        let groups = Arc::new(CountingGroups {
            inner: backend.clone(),
            establish_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        });
        let runner = Arc::new(
            MigrationPhaseRunner::new(
                backend.clone(),
                protocols.clone(),
                groups.clone(),
                backend.clone(),
                backend.clone(),
                ConversationLocks::new(),
            )
            .with_phase_timeout(timeout),
        );

        Self {
            backend,
            protocols,
            groups,
            sink: Arc::new(RecordingNotificationSink::new()),
            runner,
            team,
            alice,
            bob,
        }
    }

    fn orchestrator(&self, threshold: Option<u32>) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            self.runner.clone(),
            self.backend.clone(),
            self.backend.clone(),
            self.sink.clone(),
        )
        .with_retry_exhaustion_threshold(threshold)
    }

    fn conversation(&self, protocol: Protocol, group_id: Option<GroupId>) -> ConversationId {
        let conversation = Conversation {
            id: ConversationId(QualifiedId::random("example.com")),
            name: "team chat".into(),
            kind: ConversationKind::Group,
            team_id: Some(self.team),
            group_id,
            protocol,
            verification_state: VerificationState::Unverified,
            members: vec![self.alice.clone(), self.bob.clone()],
        };
        let id = conversation.id.clone();
        self.backend.insert_conversation(conversation).unwrap();
        id
    }

    fn stored(&self, id: &ConversationId) -> Conversation {
        self.backend.conversation_snapshot(id).unwrap().unwrap()
    }
}

// ─────────────────────────── Orchestrator ───────────────────────────

#[tokio::test]
async fn legacy_conversation_migrates_to_secure_in_one_pass() {
    let fx = Fixture::new();
    let id = fx.conversation(Protocol::Legacy, None);

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.upgraded, vec![id.clone()]);
    assert_eq!(report.groups_created, vec![id.clone()]);
    assert_eq!(report.members_added, vec![(id.clone(), 1)]);
    assert_eq!(report.finalised, vec![id.clone()]);

    let stored = fx.stored(&id);
    assert_eq!(stored.protocol, Protocol::Secure);
    let group = stored.group_id.unwrap();
    let members = fx.backend.group_member_list(&group).unwrap();
    assert!(members.contains(&fx.alice) && members.contains(&fx.bob));
    assert_eq!(fx.backend.refresh_count().unwrap(), 1);
}

#[tokio::test]
async fn transitional_conversation_waits_until_migration_started() {
    let fx = Fixture::new();
    fx.backend
        .set_migration_status(MigrationStatus::NotStarted)
        .unwrap();
    let id = fx.conversation(Protocol::Legacy, None);

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert_eq!(report.upgraded, vec![id.clone()]);
    assert!(report.finalised.is_empty());
    assert_eq!(fx.stored(&id).protocol, Protocol::Transitional);
}

#[tokio::test]
async fn failed_upgrade_stays_legacy_and_is_retried() {
    let fx = Fixture::new();
    let id = fx.conversation(Protocol::Legacy, None);
    fx.protocols.reject(&id, Rejection::Error);
    let orchestrator = fx.orchestrator(None);

    let report = orchestrator.run_pass().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].conversation, id);
    assert_eq!(report.failed[0].phase, MigrationPhase::Upgrade);
    assert_eq!(fx.stored(&id).protocol, Protocol::Legacy);
    assert_eq!(fx.groups.establish_calls.load(Ordering::SeqCst), 0);

    fx.protocols.accept(&id);
    let report = orchestrator.run_pass().await.unwrap();
    assert_eq!(report.upgraded, vec![id.clone()]);
    assert_eq!(fx.stored(&id).protocol, Protocol::Secure);
}

#[tokio::test]
async fn ignored_upgrade_is_detected() {
    let fx = Fixture::new();
    let id = fx.conversation(Protocol::Legacy, None);
    fx.protocols.reject(&id, Rejection::Ignore);

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(report.upgraded.is_empty());
    assert_eq!(fx.stored(&id).protocol, Protocol::Legacy);
    assert_eq!(fx.groups.establish_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_failing_conversation_does_not_block_others() {
    let fx = Fixture::new();
    let failing = fx.conversation(Protocol::Legacy, None);
    let healthy = fx.conversation(Protocol::Legacy, None);
    fx.protocols.reject(&failing, Rejection::Error);

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.finalised, vec![healthy.clone()]);
    assert_eq!(fx.stored(&failing).protocol, Protocol::Legacy);
    assert_eq!(fx.stored(&healthy).protocol, Protocol::Secure);
}

#[tokio::test]
async fn interrupted_creation_resumes_without_recreating_the_group() {
    let fx = Fixture::new();
    fx.backend
        .set_migration_status(MigrationStatus::NotStarted)
        .unwrap();
    let group = GroupId("half-done".into());
    // Created by this client, members never added.
    fx.backend
        .set_group_members(&group, vec![fx.alice.clone()])
        .unwrap();
    let id = fx.conversation(Protocol::Transitional, Some(group.clone()));
    let orchestrator = fx.orchestrator(None);

    let report = orchestrator.run_pass().await.unwrap();
    assert_eq!(report.members_added, vec![(id.clone(), 1)]);
    assert!(report.groups_created.is_empty());
    assert_eq!(fx.groups.establish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.backend.groups_created().unwrap(), 0);

    let report = orchestrator.run_pass().await.unwrap();
    assert!(report.members_added.is_empty());
    assert_eq!(fx.groups.add_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        fx.backend.group_member_list(&group).unwrap(),
        vec![fx.alice.clone(), fx.bob.clone()]
    );
}

#[tokio::test]
async fn joiner_never_adds_members() {
    let fx = Fixture::new();
    fx.backend
        .set_migration_status(MigrationStatus::NotStarted)
        .unwrap();
    let group = GroupId("peer-created".into());
    fx.backend
        .set_group_members(&group, vec![fx.bob.clone()])
        .unwrap();
    let id = fx.conversation(Protocol::Transitional, Some(group.clone()));

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert_eq!(report.groups_joined, vec![id]);
    assert!(report.members_added.is_empty());
    assert_eq!(fx.groups.add_calls.load(Ordering::SeqCst), 0);
    assert!(fx.backend.group_member_list(&group).unwrap().contains(&fx.alice));
}

#[tokio::test]
async fn non_team_legacy_conversations_are_not_initialised() {
    let fx = Fixture::new();
    let conversation = Conversation {
        id: ConversationId(QualifiedId::random("example.com")),
        name: "guest chat".into(),
        kind: ConversationKind::Group,
        team_id: Some(Uuid::new_v4()),
        group_id: None,
        protocol: Protocol::Legacy,
        verification_state: VerificationState::Unverified,
        members: vec![fx.alice.clone(), fx.bob.clone()],
    };
    let id = conversation.id.clone();
    fx.backend.insert_conversation(conversation).unwrap();

    let report = fx.orchestrator(None).run_pass().await.unwrap();

    assert!(report.upgraded.is_empty());
    assert_eq!(fx.stored(&id).protocol, Protocol::Legacy);
}

#[tokio::test]
async fn phase_timeout_is_a_phase_failure() {
    let fx = Fixture::with_timeout(Duration::from_millis(50));
    fx.groups.set_delay(Some(Duration::from_secs(10)));
    let id = fx.conversation(Protocol::Legacy, None);
    let orchestrator = fx.orchestrator(None);

    let report = orchestrator.run_pass().await.unwrap();

    // The upgrade went through; joining timed out in both the initialise and join steps.
    assert_eq!(report.failed.len(), 2);
    assert!(report
        .failed
        .iter()
        .all(|f| f.conversation == id && f.phase == MigrationPhase::EstablishAndJoin));
    assert!(report.failed[0].error.contains("timed out"));
    assert_eq!(fx.stored(&id).protocol, Protocol::Transitional);

    fx.groups.set_delay(None);
    let report = orchestrator.run_pass().await.unwrap();
    assert_eq!(report.groups_created, vec![id.clone()]);
    assert_eq!(fx.stored(&id).protocol, Protocol::Secure);
}

#[tokio::test]
async fn overlapping_pass_is_skipped() {
    let fx = Fixture::new();
    fx.groups.set_delay(Some(Duration::from_millis(200)));
    fx.conversation(Protocol::Legacy, None);
    let orchestrator = fx.orchestrator(None);

    let (first, second) = tokio::join!(orchestrator.run_pass(), orchestrator.run_pass());

    assert!(first.is_some());
    assert!(second.is_none());
    assert!(orchestrator.run_pass().await.is_some());
}

#[tokio::test]
async fn repeated_failures_raise_a_single_alert() {
    let fx = Fixture::new();
    let id = fx.conversation(Protocol::Legacy, None);
    fx.protocols.reject(&id, Rejection::Error);
    let orchestrator = fx.orchestrator(Some(2));

    orchestrator.run_pass().await.unwrap();
    assert!(fx.sink.alerts().is_empty());

    orchestrator.run_pass().await.unwrap();
    assert_eq!(fx.sink.alerts(), vec![(id.clone(), 2)]);

    orchestrator.run_pass().await.unwrap();
    assert_eq!(fx.sink.alerts().len(), 1);
    assert_eq!(orchestrator.consecutive_failures(&id).await, 3);

    fx.protocols.accept(&id);
    orchestrator.run_pass().await.unwrap();
    assert_eq!(orchestrator.consecutive_failures(&id).await, 0);
}

#[tokio::test]
async fn failures_are_only_logged_without_threshold() {
    let fx = Fixture::new();
    let id = fx.conversation(Protocol::Legacy, None);
    fx.protocols.reject(&id, Rejection::Error);
    let orchestrator = fx.orchestrator(None);

    for _ in 0..3 {
        orchestrator.run_pass().await.unwrap();
    }

    assert!(fx.sink.alerts().is_empty());
    assert_eq!(orchestrator.consecutive_failures(&id).await, 3);
}

// ─────────────────────────── Phase runner ───────────────────────────

#[tokio::test]
async fn finalise_waits_for_every_member_to_join() {
    let fx = Fixture::new();
    let group = GroupId("partial".into());
    let carol = UserId(QualifiedId::random("example.com"));
    fx.backend
        .set_group_members(&group, vec![fx.alice.clone(), carol.clone()])
        .unwrap();
    let id = fx.conversation(Protocol::Transitional, Some(group));

    let outcome = fx.runner.finalise_transitional(&id, Utc::now()).await.unwrap();
    assert!(!outcome.finalised);
    assert_eq!(fx.stored(&id).protocol, Protocol::Transitional);
}

#[tokio::test]
async fn finalise_proceeds_after_deadline() {
    let fx = Fixture::new();
    let group = GroupId("partial".into());
    let carol = UserId(QualifiedId::random("example.com"));
    fx.backend
        .set_group_members(&group, vec![fx.alice.clone(), carol])
        .unwrap();
    fx.backend
        .set_finalise_regardless_after(Some(Utc::now() - TimeDelta::hours(1)))
        .unwrap();
    let id = fx.conversation(Protocol::Transitional, Some(group));

    let outcome = fx.runner.finalise_transitional(&id, Utc::now()).await.unwrap();
    assert!(outcome.finalised);
    assert_eq!(fx.stored(&id).protocol, Protocol::Secure);
}

#[tokio::test]
async fn finalise_requires_local_membership() {
    let fx = Fixture::new();
    let group = GroupId("not-joined".into());
    fx.backend
        .set_group_members(&group, vec![fx.bob.clone()])
        .unwrap();
    fx.backend
        .set_finalise_regardless_after(Some(Utc::now() - TimeDelta::hours(1)))
        .unwrap();
    let id = fx.conversation(Protocol::Transitional, Some(group));

    let outcome = fx.runner.finalise_transitional(&id, Utc::now()).await.unwrap();
    assert!(!outcome.finalised);
}

#[tokio::test]
async fn protocol_never_moves_backwards() {
    let fx = Fixture::new();
    let group = GroupId("secure".into());
    fx.backend
        .set_group_members(&group, vec![fx.alice.clone(), fx.bob.clone()])
        .unwrap();
    let id = fx.conversation(Protocol::Secure, Some(group));
    let conversation = fx.stored(&id);

    let err = fx.runner.finalise(&conversation, Utc::now()).await.unwrap_err();
    assert!(matches!(err, MigrationError::ProtocolRegression { .. }));

    // Entry points leave conversations past their step alone.
    let outcome = fx.runner.initialise(&id).await.unwrap();
    assert!(!outcome.upgraded);
    assert_eq!(fx.stored(&id).protocol, Protocol::Secure);
}

#[tokio::test]
async fn missing_conversation_fails_at_load() {
    let fx = Fixture::new();
    let id = ConversationId(QualifiedId::random("example.com"));

    let err = fx.runner.initialise(&id).await.unwrap_err();
    assert_eq!(err.phase(), MigrationPhase::Load);
}
