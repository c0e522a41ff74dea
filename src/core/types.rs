//! Domain types shared by verification and migration.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-qualified identifier (`id@domain`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedId {
    pub id: Uuid,
    pub domain: String,
}

impl QualifiedId {
    pub fn new(id: Uuid, domain: impl Into<String>) -> Self {
        Self {
            id,
            domain: domain.into(),
        }
    }

    /// Fresh random id on the given domain.
    pub fn random(domain: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), domain)
    }
}

impl Display for QualifiedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.domain)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub QualifiedId);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub QualifiedId);

/// Client (device) id. Unique across users.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

/// Opaque handle of a security group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl GroupId {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Transport protocol of a conversation.
///
/// Ordered: migration only ever moves a conversation to a greater variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Pairwise encryption.
    Legacy,
    /// Pairwise and group encryption side by side.
    Transitional,
    /// Group encryption only.
    Secure,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = match self {
            Protocol::Legacy => "legacy",
            Protocol::Transitional => "transitional",
            Protocol::Secure => "secure",
        };
        write!(f, "{protocol}")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationState {
    /// No check has completed yet.
    #[default]
    Unverified,
    Verified,
    Degraded,
}

impl Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            VerificationState::Unverified => "Unverified",
            VerificationState::Verified => "Verified",
            VerificationState::Degraded => "Degraded",
        };
        write!(f, "{state}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    Group,
    OneToOne,
    SelfConversation,
}

/// Conversation record as held by the conversation store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub kind: ConversationKind,
    /// Owning team, if any.
    pub team_id: Option<Uuid>,
    /// Present once a security group exists for the conversation.
    pub group_id: Option<GroupId>,
    pub protocol: Protocol,
    pub verification_state: VerificationState,
    /// Participants, in display order. Includes the self user when they participate.
    pub members: Vec<UserId>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Group id, if one is set and non-empty.
    pub fn established_group_id(&self) -> Option<&GroupId> {
        self.group_id.as_ref().filter(|g| !g.is_empty())
    }
}

/// Device and its owner.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
}

/// Certificate-backed binding of a device to a user within one group, at one epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityClaim {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub certificate: Vec<u8>,
}

/// Epoch change of a security group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEvent {
    pub group_id: GroupId,
    pub epoch: u64,
}

/// Team-wide migration switch, refreshed from policy outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Disabled,
    NotStarted,
    Started,
}

impl Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            MigrationStatus::Disabled => "Disabled",
            MigrationStatus::NotStarted => "NotStarted",
            MigrationStatus::Started => "Started",
        };
        write!(f, "{status}")
    }
}

/// Result of establishing or joining the security group of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupEstablishment {
    /// The local client created the group and is responsible for adding members.
    Created,
    /// A peer created the group; the local client joined it.
    Joined,
}
