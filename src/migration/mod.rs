//! Protocol migration: legacy → transitional → secure.
//!
//! - [`MigrationPhaseRunner`] - idempotent phases for one conversation
//! - [`MigrationOrchestrator`] - one pass over every eligible conversation
//! - [`MigrationScheduler`] - gated recurring pass

mod orchestrator;
mod phase_runner;
mod scheduler;

pub use orchestrator::{MigrationFailure, MigrationOrchestrator, MigrationPass, MigrationReport};
pub use phase_runner::{
    MigrationError, MigrationPhase, MigrationPhaseRunner, PhaseOutcome, DEFAULT_PHASE_TIMEOUT,
};
pub use scheduler::{
    MigrationGate, MigrationScheduler, RecurringTask, RecurringTaskHost, TokioTaskHost,
    DEFAULT_MIGRATION_INTERVAL, MIGRATION_TASK_KEY,
};
