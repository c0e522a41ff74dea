//! Migration phases for a single conversation.
//!
//! Every phase is idempotent: it inspects the current state first and only does the work that
//! is still missing, so a conversation interrupted at any point resumes on the next pass.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::{
    Conversation, ConversationId, ConversationLocks, ConversationStore, GroupEstablishment,
    GroupId, GroupLifecycleService, MigrationPolicySource, MigrationStatus, Protocol,
    ProtocolStore, ServiceError, UserDirectory, UserId,
};

/// Default bound on every external call made by a phase.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MigrationPhase {
    /// Reading the conversation back from the store.
    Load,
    Upgrade,
    EstablishAndJoin,
    AddMembers,
    Finalise,
}

impl Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            MigrationPhase::Load => "load",
            MigrationPhase::Upgrade => "upgrade",
            MigrationPhase::EstablishAndJoin => "establish-and-join",
            MigrationPhase::AddMembers => "add-members",
            MigrationPhase::Finalise => "finalise",
        };
        write!(f, "{phase}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Conversation {conversation} was not moved to {expected}, store holds {actual}")]
    UpdateRejected {
        phase: MigrationPhase,
        conversation: ConversationId,
        expected: Protocol,
        actual: Protocol,
    },

    #[error("Conversation {conversation} has no security group")]
    MissingGroupId {
        phase: MigrationPhase,
        conversation: ConversationId,
    },

    #[error("Refusing to move conversation {conversation} from {from} to {to}")]
    ProtocolRegression {
        conversation: ConversationId,
        from: Protocol,
        to: Protocol,
    },

    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        phase: MigrationPhase,
        timeout: Duration,
    },

    #[error("{phase} failed: {source}")]
    Service {
        phase: MigrationPhase,
        #[source]
        source: ServiceError,
    },
}

impl MigrationError {
    pub fn phase(&self) -> MigrationPhase {
        match self {
            MigrationError::ConversationNotFound(_) => MigrationPhase::Load,
            MigrationError::UpdateRejected { phase, .. } => *phase,
            MigrationError::MissingGroupId { phase, .. } => *phase,
            MigrationError::ProtocolRegression { to, .. } => match to {
                Protocol::Secure => MigrationPhase::Finalise,
                _ => MigrationPhase::Upgrade,
            },
            MigrationError::Timeout { phase, .. } => *phase,
            MigrationError::Service { phase, .. } => *phase,
        }
    }
}

/// What one phase run changed for a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub upgraded: bool,
    pub establishment: Option<GroupEstablishment>,
    pub members_added: usize,
    pub finalised: bool,
}

pub struct MigrationPhaseRunner {
    conversations: Arc<dyn ConversationStore>,
    protocol_store: Arc<dyn ProtocolStore>,
    groups: Arc<dyn GroupLifecycleService>,
    policy: Arc<dyn MigrationPolicySource>,
    directory: Arc<dyn UserDirectory>,
    locks: ConversationLocks,
    phase_timeout: Duration,
}

impl MigrationPhaseRunner {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        protocol_store: Arc<dyn ProtocolStore>,
        groups: Arc<dyn GroupLifecycleService>,
        policy: Arc<dyn MigrationPolicySource>,
        directory: Arc<dyn UserDirectory>,
        locks: ConversationLocks,
    ) -> Self {
        Self {
            conversations,
            protocol_store,
            groups,
            policy,
            directory,
            locks,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    // ─────────────────────────── Entry points ───────────────────────────

    /// Upgrade a legacy conversation, then establish or join its group and, if this client
    /// created the group, add the other members.
    pub async fn initialise(&self, id: &ConversationId) -> Result<PhaseOutcome, MigrationError> {
        let _guard = self.locks.lock(id).await;
        let conversation = self.load(id).await?;
        if conversation.protocol != Protocol::Legacy {
            return Ok(PhaseOutcome::default());
        }

        info!("[initialise]: Initialising migration for conversation {id}");
        let conversation = self.upgrade(&conversation).await?;
        let mut outcome = self.join_or_resume(&conversation).await?;
        outcome.upgraded = true;
        Ok(outcome)
    }

    /// Join the group of a transitional conversation the local client is not part of yet, or
    /// resume adding members to a group it created.
    pub async fn join_unestablished(
        &self,
        id: &ConversationId,
    ) -> Result<PhaseOutcome, MigrationError> {
        let _guard = self.locks.lock(id).await;
        let conversation = self.load(id).await?;
        if conversation.protocol != Protocol::Transitional {
            return Ok(PhaseOutcome::default());
        }
        self.join_or_resume(&conversation).await
    }

    /// Promote a transitional conversation to the secure protocol if it is ready.
    pub async fn finalise_transitional(
        &self,
        id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<PhaseOutcome, MigrationError> {
        let _guard = self.locks.lock(id).await;
        let conversation = self.load(id).await?;
        if conversation.protocol != Protocol::Transitional {
            return Ok(PhaseOutcome::default());
        }
        Ok(PhaseOutcome {
            finalised: self.finalise(&conversation, now).await?,
            ..Default::default()
        })
    }

    // ─────────────────────────── Phases ───────────────────────────

    /// Move a legacy conversation to the transitional protocol.
    ///
    /// Only succeeds if the stored record really is transitional and carries a group id.
    pub async fn upgrade(&self, conversation: &Conversation) -> Result<Conversation, MigrationError> {
        if conversation.protocol != Protocol::Legacy {
            return Ok(conversation.clone());
        }

        let updated = self
            .promote(conversation, Protocol::Transitional, MigrationPhase::Upgrade)
            .await?;
        if updated.established_group_id().is_none() {
            return Err(MigrationError::MissingGroupId {
                phase: MigrationPhase::Upgrade,
                conversation: conversation.id.clone(),
            });
        }

        info!(
            "[upgrade]: Conversation {} is now transitional with group {:?}",
            updated.id, updated.group_id
        );
        Ok(updated)
    }

    /// Establish the group of the conversation, or join it if a peer already did.
    ///
    /// Returns `None` when the local client is already a member.
    pub async fn establish_and_join(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<GroupEstablishment>, MigrationError> {
        let phase = MigrationPhase::EstablishAndJoin;
        let group_id = self.group_id(conversation, phase)?;

        if self.call(phase, self.groups.is_member(group_id)).await? {
            return Ok(None);
        }

        let establishment = self
            .call(phase, self.groups.establish_or_join_group(conversation))
            .await?;
        info!(
            "[establish_and_join]: Group {group_id} of conversation {}: {establishment:?}",
            conversation.id
        );
        Ok(Some(establishment))
    }

    /// Add every member except the self user to the group. Returns the number of users added.
    pub async fn add_members(&self, conversation: &Conversation) -> Result<usize, MigrationError> {
        let others = self.other_members(conversation);
        if others.is_empty() {
            return Ok(0);
        }

        self.call(
            MigrationPhase::AddMembers,
            self.groups.add_members(conversation, &others),
        )
        .await?;
        info!(
            "[add_members]: Added {} member(s) to the group of conversation {}",
            others.len(),
            conversation.id
        );
        Ok(others.len())
    }

    /// Promote to the secure protocol once migration has started and every member has joined
    /// the group, or unconditionally after the policy's finalisation deadline.
    pub async fn finalise(
        &self,
        conversation: &Conversation,
        now: DateTime<Utc>,
    ) -> Result<bool, MigrationError> {
        let phase = MigrationPhase::Finalise;

        let status = self.call(phase, self.policy.migration_status()).await?;
        if status != MigrationStatus::Started {
            debug!(
                "[finalise]: Migration is {status}, not finalising {}",
                conversation.id
            );
            return Ok(false);
        }

        let group_id = self.group_id(conversation, phase)?;
        if !self.call(phase, self.groups.is_member(group_id)).await? {
            debug!(
                "[finalise]: Not a member of group {group_id} yet, not finalising {}",
                conversation.id
            );
            return Ok(false);
        }

        let group_members = self.call(phase, self.groups.group_members(group_id)).await?;
        let all_joined = conversation
            .members
            .iter()
            .all(|m| group_members.contains(m));
        let deadline_passed = self
            .call(phase, self.policy.finalise_regardless_after())
            .await?
            .is_some_and(|deadline| now >= deadline);

        if !all_joined && !deadline_passed {
            debug!(
                "[finalise]: Some members of {} have not joined group {group_id}",
                conversation.id
            );
            return Ok(false);
        }

        self.promote(conversation, Protocol::Secure, phase).await?;
        info!(
            "[finalise]: Conversation {} migrated to the secure protocol",
            conversation.id
        );
        Ok(true)
    }

    // ─────────────────────────── Helpers ───────────────────────────

    async fn join_or_resume(
        &self,
        conversation: &Conversation,
    ) -> Result<PhaseOutcome, MigrationError> {
        let mut outcome = PhaseOutcome::default();

        match self.establish_and_join(conversation).await? {
            // Only the creator adds members; a joiner never does.
            Some(GroupEstablishment::Created) => {
                outcome.establishment = Some(GroupEstablishment::Created);
                outcome.members_added = self.add_members(conversation).await?;
            }
            Some(GroupEstablishment::Joined) => {
                outcome.establishment = Some(GroupEstablishment::Joined);
            }
            None => {
                if self.is_unfinished_creation(conversation).await? {
                    info!(
                        "[join_or_resume]: Resuming member addition for conversation {}",
                        conversation.id
                    );
                    outcome.members_added = self.add_members(conversation).await?;
                }
            }
        }
        Ok(outcome)
    }

    /// A group the local client is in alone, while the conversation has other members, was
    /// created here and never had members added.
    async fn is_unfinished_creation(
        &self,
        conversation: &Conversation,
    ) -> Result<bool, MigrationError> {
        if self.other_members(conversation).is_empty() {
            return Ok(false);
        }
        let group_id = self.group_id(conversation, MigrationPhase::AddMembers)?;
        let members = self
            .call(MigrationPhase::AddMembers, self.groups.group_members(group_id))
            .await?;
        let self_user = self.directory.self_user();
        Ok(!members.is_empty() && members.iter().all(|m| *m == self_user))
    }

    async fn promote(
        &self,
        conversation: &Conversation,
        target: Protocol,
        phase: MigrationPhase,
    ) -> Result<Conversation, MigrationError> {
        if conversation.protocol >= target {
            return Err(MigrationError::ProtocolRegression {
                conversation: conversation.id.clone(),
                from: conversation.protocol,
                to: target,
            });
        }

        let updated = self
            .call(phase, self.protocol_store.update_protocol(conversation, target))
            .await?;
        if updated.protocol != target {
            return Err(MigrationError::UpdateRejected {
                phase,
                conversation: conversation.id.clone(),
                expected: target,
                actual: updated.protocol,
            });
        }
        Ok(updated)
    }

    async fn load(&self, id: &ConversationId) -> Result<Conversation, MigrationError> {
        self.call(MigrationPhase::Load, self.conversations.conversation(id))
            .await?
            .ok_or_else(|| MigrationError::ConversationNotFound(id.clone()))
    }

    fn group_id<'a>(
        &self,
        conversation: &'a Conversation,
        phase: MigrationPhase,
    ) -> Result<&'a GroupId, MigrationError> {
        conversation
            .established_group_id()
            .ok_or_else(|| MigrationError::MissingGroupId {
                phase,
                conversation: conversation.id.clone(),
            })
    }

    fn other_members(&self, conversation: &Conversation) -> Vec<UserId> {
        let self_user = self.directory.self_user();
        conversation
            .members
            .iter()
            .filter(|m| **m != self_user)
            .cloned()
            .collect()
    }

    async fn call<T, F>(&self, phase: MigrationPhase, call: F) -> Result<T, MigrationError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout(self.phase_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(MigrationError::Service { phase, source }),
            Err(_) => Err(MigrationError::Timeout {
                phase,
                timeout: self.phase_timeout,
            }),
        }
    }
}
