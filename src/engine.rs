//! Wiring of the verification and migration components.

use std::sync::Arc;

use identity_certs::CertificateValidator;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::core::{
    ConversationLocks, ConversationStore, EpochNotificationSource, GroupLifecycleService,
    IdentityResolutionService, MigrationPolicySource, NotificationSink, ProtocolStore,
    UserDirectory,
};
use crate::migration::{
    MigrationGate, MigrationOrchestrator, MigrationPhaseRunner, MigrationScheduler,
    RecurringTaskHost,
};
use crate::verification::{
    DeviceIdentityResolver, EpochEventHandler, EpochEventMonitor, VerificationStateMachine,
    VerifiedDevices,
};

/// Services the engine consumes.
#[derive(Clone)]
pub struct Services {
    pub conversations: Arc<dyn ConversationStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub identities: Arc<dyn IdentityResolutionService>,
    pub protocol_store: Arc<dyn ProtocolStore>,
    pub groups: Arc<dyn GroupLifecycleService>,
    pub policy: Arc<dyn MigrationPolicySource>,
    /// `None` when the secure group service is unavailable.
    pub epochs: Option<Arc<dyn EpochNotificationSource>>,
    pub sink: Arc<dyn NotificationSink>,
    /// Trust anchors. The engine applies its own expiry warning window on top.
    pub validator: Arc<CertificateValidator>,
}

pub struct TrustEngine {
    state_machine: Arc<VerificationStateMachine>,
    orchestrator: Arc<MigrationOrchestrator>,
    scheduler: Arc<MigrationScheduler>,
    monitor: EpochEventMonitor,
    cancel: CancellationToken,
}

impl TrustEngine {
    /// Build every component, start the epoch monitor and activate the migration scheduler.
    ///
    /// Returns the engine together with the decision of the immediate migration check.
    pub async fn start(
        services: Services,
        config: &EngineConfig,
        host: &dyn RecurringTaskHost,
    ) -> (Self, MigrationGate) {
        let locks = ConversationLocks::new();
        let verified = VerifiedDevices::new();

        let validator = Arc::new(
            CertificateValidator::clone(&services.validator)
                .with_expiry_warning(config.verification.expiry_warning()),
        );
        let resolver =
            DeviceIdentityResolver::new(services.identities.clone(), validator, verified);
        let state_machine = Arc::new(
            VerificationStateMachine::new(
                services.conversations.clone(),
                services.directory.clone(),
                resolver,
                services.sink.clone(),
                locks.clone(),
            )
            .with_renotify_on_reverify(config.verification.renotify_on_reverify)
            .with_call_timeout(config.verification.check_timeout()),
        );

        let cancel = CancellationToken::new();
        let handler = Arc::new(EpochEventHandler::new(
            services.conversations.clone(),
            state_machine.clone(),
        ));
        let monitor = EpochEventMonitor::start_with_worker_idle(
            services.epochs.clone(),
            handler,
            config.monitor.queue_capacity,
            config.monitor.worker_idle(),
            cancel.clone(),
        );

        let runner = Arc::new(
            MigrationPhaseRunner::new(
                services.conversations.clone(),
                services.protocol_store.clone(),
                services.groups.clone(),
                services.policy.clone(),
                services.directory.clone(),
                locks,
            )
            .with_phase_timeout(config.migration.phase_timeout()),
        );
        let orchestrator = Arc::new(
            MigrationOrchestrator::new(
                runner,
                services.conversations.clone(),
                services.directory.clone(),
                services.sink.clone(),
            )
            .with_retry_exhaustion_threshold(config.migration.retry_exhaustion_threshold),
        );
        let scheduler = Arc::new(
            MigrationScheduler::new(
                services.policy.clone(),
                services.directory.clone(),
                orchestrator.clone(),
            )
            .with_interval(config.migration.interval()),
        );

        info!(
            "[trust_engine]: Started (epoch monitor {})",
            if monitor.is_active() { "active" } else { "inert" }
        );
        let gate = scheduler.clone().activate(host).await;
        info!("[trust_engine]: Initial migration check: {gate}");

        (
            Self {
                state_machine,
                orchestrator,
                scheduler,
                monitor,
                cancel,
            },
            gate,
        )
    }

    pub fn verified_devices(&self) -> VerifiedDevices {
        self.state_machine.resolver().verified_devices().clone()
    }

    pub fn state_machine(&self) -> &Arc<VerificationStateMachine> {
        &self.state_machine
    }

    pub fn orchestrator(&self) -> &Arc<MigrationOrchestrator> {
        &self.orchestrator
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_active()
    }

    /// Run the gated migration check now, outside the recurring schedule.
    pub async fn run_migration_pass(&self) -> MigrationGate {
        self.scheduler.check_and_run().await
    }

    /// Stop the epoch monitor and wait for in-flight checks to finish.
    ///
    /// The recurring migration task belongs to the task host and is stopped there.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.monitor.join().await;
        info!("[trust_engine]: Stopped");
    }
}
