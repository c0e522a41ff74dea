//! Interfaces of the services this crate consumes.
//!
//! Everything that persists state or talks to a backend sits behind one of these traits and is
//! injected at construction, so each one can be replaced by a test double.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::error::ServiceError;
use super::types::{
    Conversation, ConversationId, DeviceId, EpochEvent, GroupEstablishment, GroupId,
    IdentityClaim, MigrationStatus, Protocol, UserId, VerificationState,
};

/// Local conversation store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn conversation(&self, id: &ConversationId)
        -> Result<Option<Conversation>, ServiceError>;

    async fn conversation_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<Conversation>, ServiceError>;

    /// All group conversations known locally.
    async fn group_conversations(&self) -> Result<Vec<Conversation>, ServiceError>;

    /// Group conversations owned by the self user's team.
    async fn self_team_group_conversations(&self) -> Result<Vec<Conversation>, ServiceError>;

    async fn set_verification_state(
        &self,
        id: &ConversationId,
        state: VerificationState,
    ) -> Result<(), ServiceError>;
}

/// Users and devices known to the local client.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    fn self_user(&self) -> UserId;

    /// The local client of the self user, if registered.
    fn local_device(&self) -> Option<DeviceId>;

    /// Known devices of a user. For the self user this may omit the local device.
    async fn devices(&self, user: &UserId) -> Result<Vec<DeviceId>, ServiceError>;

    /// Refetch all known users, including the protocols they support.
    async fn refresh_known_users(&self) -> Result<(), ServiceError>;
}

/// Resolves certificate-backed identities of devices inside a security group.
#[async_trait]
pub trait IdentityResolutionService: Send + Sync {
    /// Claims for the subset of `device_owners` that hold a certificate in `group_id`.
    async fn resolve_identities(
        &self,
        group_id: &GroupId,
        device_owners: &HashMap<DeviceId, UserId>,
    ) -> Result<Vec<IdentityClaim>, ServiceError>;
}

/// Authoritative store of conversation protocols.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Request a protocol change and return the record as stored afterwards.
    ///
    /// The backend may reject or ignore the request; callers must inspect the returned record.
    async fn update_protocol(
        &self,
        conversation: &Conversation,
        target: Protocol,
    ) -> Result<Conversation, ServiceError>;
}

/// Security group lifecycle of the local client.
#[async_trait]
pub trait GroupLifecycleService: Send + Sync {
    /// Whether the local client is already a member of the group.
    async fn is_member(&self, group_id: &GroupId) -> Result<bool, ServiceError>;

    /// Users currently in the group.
    async fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, ServiceError>;

    /// Create the group of the conversation, or join it if a peer created it first.
    async fn establish_or_join_group(
        &self,
        conversation: &Conversation,
    ) -> Result<GroupEstablishment, ServiceError>;

    /// Add every device of the given users to the group of the conversation.
    async fn add_members(
        &self,
        conversation: &Conversation,
        members: &[UserId],
    ) -> Result<(), ServiceError>;
}

/// Migration policy and protocol support, refreshed outside this crate.
#[async_trait]
pub trait MigrationPolicySource: Send + Sync {
    /// Whether this environment can run the secure group protocol at all.
    async fn is_secure_protocol_supported_by_environment(&self) -> bool;

    async fn supported_protocols(&self, user: &UserId) -> Result<HashSet<Protocol>, ServiceError>;

    async fn migration_status(&self) -> Result<MigrationStatus, ServiceError>;

    /// Point after which transitional conversations are finalised even if some members never
    /// joined the group.
    async fn finalise_regardless_after(&self) -> Result<Option<DateTime<Utc>>, ServiceError> {
        Ok(None)
    }
}

/// Source of group epoch changes.
pub trait EpochNotificationSource: Send + Sync {
    /// Start delivering epoch events into `sink`. Delivery is at-least-once.
    fn subscribe(&self, sink: mpsc::Sender<EpochEvent>);
}
