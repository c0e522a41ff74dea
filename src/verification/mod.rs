//! Conversation verification.
//!
//! - [`DeviceIdentityResolver`] - resolves and validates device certificates of a group
//! - [`VerificationStateMachine`] - decides `Verified` / `Degraded` for a conversation
//! - [`EpochEventMonitor`] - runs the state machine on every epoch change

mod monitor;
mod resolver;
mod state_machine;

pub use monitor::{
    EpochDisposition, EpochEventHandler, EpochEventMonitor, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKER_IDLE,
};
pub use resolver::{DeviceIdentityResolver, ResolvedIdentity, VerifiedDevices};
pub use state_machine::{
    VerificationError, VerificationOutcome, VerificationStateMachine, DEFAULT_CHECK_TIMEOUT,
};
