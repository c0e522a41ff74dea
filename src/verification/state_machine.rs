//! Conversation verification state machine.
//!
//! A conversation is only ever moved to `Verified` when every known device of every member
//! (the self user's local device included) resolved a trustworthy certificate. Anything less
//! moves it to `Degraded`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::resolver::DeviceIdentityResolver;
use crate::core::{
    Conversation, ConversationId, ConversationLocks, ConversationStore, Device, DeviceId,
    NotificationSink, Protocol, ServiceError, UserDirectory, UserId, VerificationChange,
    VerificationReason, VerificationState,
};

/// Default bound on each external call made during a check.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a single verification attempt. None of them changes the conversation state.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Conversation {0} uses the {1} protocol")]
    NotSecure(ConversationId, Protocol),

    #[error("Conversation {0} has no security group")]
    MissingGroupId(ConversationId),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

/// Result of a verification attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub previous: VerificationState,
    pub current: VerificationState,
    /// Devices that did not resolve a trustworthy certificate.
    pub untrusted_devices: Vec<DeviceId>,
    /// Notification sent to the sink, if any.
    pub notification: Option<VerificationChange>,
}

impl VerificationOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

pub struct VerificationStateMachine {
    conversations: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    resolver: DeviceIdentityResolver,
    sink: Arc<dyn NotificationSink>,
    locks: ConversationLocks,
    renotify_on_reverify: bool,
    call_timeout: Duration,
}

impl VerificationStateMachine {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        resolver: DeviceIdentityResolver,
        sink: Arc<dyn NotificationSink>,
        locks: ConversationLocks,
    ) -> Self {
        Self {
            conversations,
            directory,
            resolver,
            sink,
            locks,
            renotify_on_reverify: false,
            call_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether a check that keeps a verified conversation verified notifies the sink again.
    pub fn with_renotify_on_reverify(mut self, renotify: bool) -> Self {
        self.renotify_on_reverify = renotify;
        self
    }

    pub fn resolver(&self) -> &DeviceIdentityResolver {
        &self.resolver
    }

    pub async fn check_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<VerificationOutcome, VerificationError> {
        self.check_conversation_at(id, Utc::now()).await
    }

    /// Run one verification check for a conversation, evaluating certificates at `now`.
    pub async fn check_conversation_at(
        &self,
        id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome, VerificationError> {
        let _guard = self.locks.lock(id).await;

        let conversation =
            ServiceError::within(self.call_timeout, self.conversations.conversation(id))
                .await?
                .ok_or_else(|| VerificationError::ConversationNotFound(id.clone()))?;
        if conversation.protocol != Protocol::Secure {
            return Err(VerificationError::NotSecure(
                id.clone(),
                conversation.protocol,
            ));
        }
        let group_id = conversation
            .established_group_id()
            .cloned()
            .ok_or_else(|| VerificationError::MissingGroupId(id.clone()))?;

        let devices = self.collect_devices(&conversation).await?;
        let resolved = ServiceError::within(
            self.call_timeout,
            self.resolver.resolve(&group_id, &devices, now),
        )
        .await?;

        let trusted: HashSet<&DeviceId> = resolved
            .iter()
            .filter(|r| r.is_trusted())
            .map(|r| &r.claim.device_id)
            .collect();
        let untrusted: Vec<&Device> = devices
            .iter()
            .filter(|d| !trusted.contains(&d.id))
            .collect();

        let previous = conversation.verification_state;
        let (current, affected_users) = if !devices.is_empty() && untrusted.is_empty() {
            (VerificationState::Verified, Vec::new())
        } else if devices.is_empty() {
            (VerificationState::Degraded, conversation.members.clone())
        } else {
            (
                VerificationState::Degraded,
                affected_members(&conversation, &untrusted),
            )
        };

        if previous != current {
            ServiceError::within(
                self.call_timeout,
                self.conversations.set_verification_state(id, current),
            )
            .await?;
        }

        let notification = self
            .notification_for(id, previous, current, affected_users)
            .inspect(|change| {
                if change.new_state == VerificationState::Degraded {
                    info!(
                        "[check_conversation]: Conversation {} ({id}) degraded by {} member(s)",
                        conversation.name,
                        change.affected_users.len()
                    );
                } else {
                    info!(
                        "[check_conversation]: Conversation {} ({id}) {}",
                        conversation.name, change.reason
                    );
                }
            });
        if let Some(change) = &notification {
            self.sink.on_verification_state_changed(change.clone()).await;
        }

        Ok(VerificationOutcome {
            previous,
            current,
            untrusted_devices: untrusted.into_iter().map(|d| d.id.clone()).collect(),
            notification,
        })
    }

    /// Devices of every member, plus the local device for the self user.
    async fn collect_devices(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<Device>, ServiceError> {
        let self_user = self.directory.self_user();
        let local_device = self.directory.local_device();
        let mut seen = HashSet::new();
        let mut devices = Vec::new();

        for member in &conversation.members {
            let mut ids =
                ServiceError::within(self.call_timeout, self.directory.devices(member)).await?;
            if *member == self_user {
                if let Some(local) = &local_device {
                    if !ids.contains(local) {
                        ids.push(local.clone());
                    }
                }
            }
            for id in ids {
                if seen.insert(id.clone()) {
                    devices.push(Device {
                        id,
                        user_id: member.clone(),
                    });
                }
            }
        }
        Ok(devices)
    }

    fn notification_for(
        &self,
        id: &ConversationId,
        previous: VerificationState,
        current: VerificationState,
        affected_users: Vec<UserId>,
    ) -> Option<VerificationChange> {
        use VerificationState::*;

        let reason = match (previous, current) {
            (Unverified, Verified) => VerificationReason::Verified,
            (Degraded, Verified) => VerificationReason::Reverified,
            (Verified, Verified) if self.renotify_on_reverify => VerificationReason::Reasserted,
            (Verified, Degraded) => VerificationReason::Degraded,
            (Unverified, Degraded) => VerificationReason::NotVerified,
            (Verified, Verified) | (Degraded, Degraded) => return None,
            (_, Unverified) => {
                error!("[notification_for]: Conversation {id} cannot return to Unverified");
                return None;
            }
        };

        Some(VerificationChange {
            conversation: id.clone(),
            previous_state: previous,
            new_state: current,
            reason,
            affected_users,
        })
    }
}

/// Owners of untrusted devices, in member order.
fn affected_members(conversation: &Conversation, untrusted: &[&Device]) -> Vec<UserId> {
    let owners: HashSet<&UserId> = untrusted.iter().map(|d| &d.user_id).collect();
    conversation
        .members
        .iter()
        .filter(|m| owners.contains(m))
        .cloned()
        .collect()
}
