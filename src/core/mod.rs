//! Core domain of the trust engine.
//!
//! # Key Components
//!
//! - Domain types: [`Conversation`], [`Device`], [`IdentityClaim`], [`EpochEvent`]
//! - Consumed service interfaces: [`ConversationStore`], [`UserDirectory`],
//!   [`IdentityResolutionService`], [`ProtocolStore`], [`GroupLifecycleService`],
//!   [`MigrationPolicySource`], [`EpochNotificationSource`]
//! - Output events: [`NotificationSink`], [`VerificationChange`]
//! - [`ConversationLocks`] - single logical owner per conversation

mod error;
mod events;
mod locks;
mod services;
mod types;

pub use error::ServiceError;
pub use events::{NotificationSink, VerificationChange, VerificationReason};
pub use locks::ConversationLocks;
pub use services::{
    ConversationStore, EpochNotificationSource, GroupLifecycleService, IdentityResolutionService,
    MigrationPolicySource, ProtocolStore, UserDirectory,
};
pub use types::{
    Conversation, ConversationId, ConversationKind, Device, DeviceId, EpochEvent,
    GroupEstablishment, GroupId, IdentityClaim, MigrationStatus, Protocol, QualifiedId, UserId,
    VerificationState,
};
