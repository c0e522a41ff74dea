//! Conversation trust and protocol migration.
//!
//! # Architecture
//!
//! - [`core`] - domain types, interfaces of consumed services, per-conversation locks
//! - [`verification`] - device certificate resolution and the `Verified` / `Degraded` state
//!   machine, driven by group epoch changes
//! - [`migration`] - moves conversations from the legacy protocol through the transitional one
//!   to the secure group protocol
//! - [`engine`] - wires both halves to a set of [`engine::Services`]
//! - [`memory`] - in-memory implementations of every consumed service
//!
//! Certificate parsing and validation live in the `identity_certs` crate.

pub mod config;
pub mod core;
pub mod engine;
pub mod logging;
pub mod memory;
pub mod migration;
pub mod verification;

pub use engine::{Services, TrustEngine};
