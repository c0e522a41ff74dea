//! Output events of the trust engine.

use std::fmt::Display;

use async_trait::async_trait;

use super::types::{ConversationId, UserId, VerificationState};

/// Why a conversation changed (or re-asserted) its verification state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationReason {
    /// First successful verification of the conversation.
    Verified,
    /// Verified again after having been degraded.
    Reverified,
    /// Still verified at a new epoch.
    Reasserted,
    /// Lost verification: some device is no longer trusted.
    Degraded,
    /// Checked for the first time and could not be verified.
    NotVerified,
}

impl Display for VerificationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            VerificationReason::Verified => "verified",
            VerificationReason::Reverified => "reverified",
            VerificationReason::Reasserted => "reasserted",
            VerificationReason::Degraded => "degraded",
            VerificationReason::NotVerified => "not-verified",
        };
        write!(f, "{reason}")
    }
}

/// Verification transition delivered to the [`NotificationSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationChange {
    pub conversation: ConversationId,
    pub previous_state: VerificationState,
    pub new_state: VerificationState,
    pub reason: VerificationReason,
    /// Members owning at least one untrusted device. Empty unless degraded.
    pub affected_users: Vec<UserId>,
}

/// Receives conversation-level verification transitions and operator alerts.
///
/// Consumers (UI, system messages) derive per-device badges from these events instead of
/// mutating device state themselves.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn on_verification_state_changed(&self, change: VerificationChange);

    /// Called once a conversation has failed `failures` consecutive migration passes.
    async fn on_migration_retries_exhausted(&self, _conversation: &ConversationId, _failures: u32) {
    }
}
