//! Epoch change monitor.
//!
//! The monitor owns the epoch event channel. A dispatcher loop hands each event to a worker
//! dedicated to its group: groups are processed concurrently, while the events of one group
//! are processed strictly in arrival order. A worker that stays idle is released; the next
//! event of its group starts a fresh one, which waits for its predecessor to drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state_machine::{VerificationOutcome, VerificationStateMachine};
use crate::core::{
    ConversationStore, EpochEvent, EpochNotificationSource, GroupId, Protocol, ServiceError,
};

/// Default capacity of the epoch event channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default idle period after which a group worker is released.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(300);

const MIN_WORKER_IDLE: Duration = Duration::from_millis(10);

/// What happened to a single epoch event.
#[derive(Debug)]
pub enum EpochDisposition {
    /// No local conversation uses the group.
    UnknownGroup,
    /// The conversation does not use the secure protocol.
    NotSecure(Protocol),
    Checked(VerificationOutcome),
    /// The check failed; the conversation kept its previous state.
    Failed(String),
}

/// Routes an epoch event to the verification state machine.
pub struct EpochEventHandler {
    conversations: Arc<dyn ConversationStore>,
    state_machine: Arc<VerificationStateMachine>,
}

impl EpochEventHandler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        state_machine: Arc<VerificationStateMachine>,
    ) -> Self {
        Self {
            conversations,
            state_machine,
        }
    }

    pub async fn handle(&self, event: &EpochEvent) -> EpochDisposition {
        let EpochEvent { group_id, epoch } = event;
        info!("[handle_epoch]: Epoch changed to {epoch} for group {group_id}");

        let lookup = ServiceError::within(
            self.state_machine.call_timeout(),
            self.conversations.conversation_by_group(group_id),
        );
        let conversation = match lookup.await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!("[handle_epoch]: Epoch changed but no conversation uses group {group_id}");
                return EpochDisposition::UnknownGroup;
            }
            Err(e) => {
                error!("[handle_epoch]: Failed to look up group {group_id}: {e}");
                return EpochDisposition::Failed(e.to_string());
            }
        };

        if conversation.protocol != Protocol::Secure {
            debug!(
                "[handle_epoch]: Conversation {} uses the {} protocol, skipping",
                conversation.id, conversation.protocol
            );
            return EpochDisposition::NotSecure(conversation.protocol);
        }

        match self.state_machine.check_conversation(&conversation.id).await {
            Ok(outcome) => EpochDisposition::Checked(outcome),
            Err(e) => {
                error!(
                    "[handle_epoch]: Verification of conversation {} at epoch {epoch} failed: {e}",
                    conversation.id
                );
                EpochDisposition::Failed(e.to_string())
            }
        }
    }
}

pub struct EpochEventMonitor {
    dispatcher: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    active_workers: Arc<AtomicUsize>,
}

impl EpochEventMonitor {
    /// Subscribe to `source` and start processing.
    ///
    /// Without a source (the secure group service is unavailable) the monitor stays inert.
    pub fn start(
        source: Option<Arc<dyn EpochNotificationSource>>,
        handler: Arc<EpochEventHandler>,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self::start_with_worker_idle(source, handler, queue_capacity, DEFAULT_WORKER_IDLE, cancel)
    }

    /// Like [`EpochEventMonitor::start`], releasing group workers idle for `worker_idle`.
    pub fn start_with_worker_idle(
        source: Option<Arc<dyn EpochNotificationSource>>,
        handler: Arc<EpochEventHandler>,
        queue_capacity: usize,
        worker_idle: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let active_workers = Arc::new(AtomicUsize::new(0));
        let Some(source) = source else {
            info!("[epoch_monitor]: Secure group service unavailable, monitor stays inert");
            return Self {
                dispatcher: None,
                cancel,
                active_workers,
            };
        };

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        source.subscribe(tx);
        let dispatcher = tokio::spawn(run_dispatcher(
            rx,
            handler,
            worker_idle.max(MIN_WORKER_IDLE),
            active_workers.clone(),
            cancel.clone(),
        ));

        Self {
            dispatcher: Some(dispatcher),
            cancel,
            active_workers,
        }
    }

    pub fn is_active(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Number of group workers currently running.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Stop processing. Queued events are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the event stream is closed (or the monitor cancelled) and all workers drained.
    pub async fn join(self) {
        if let Some(dispatcher) = self.dispatcher {
            if let Err(e) = dispatcher.await {
                error!("[epoch_monitor]: Dispatcher task failed: {e}");
            }
        }
    }
}

struct GroupWorker {
    tx: mpsc::UnboundedSender<EpochEvent>,
    last_event: Instant,
    /// Cancelled once the worker has exited.
    done: CancellationToken,
}

/// Counts a running worker until dropped.
struct ActiveWorker(Arc<AtomicUsize>);

impl ActiveWorker {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<EpochEvent>,
    handler: Arc<EpochEventHandler>,
    worker_idle: Duration,
    active_workers: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut workers: HashMap<GroupId, GroupWorker> = HashMap::new();
    // Released workers that may still be draining their queue.
    let mut retiring: HashMap<GroupId, CancellationToken> = HashMap::new();
    let mut tasks = JoinSet::new();
    let mut sweep = tokio::time::interval(worker_idle);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                release_idle_workers(&mut workers, &mut retiring, worker_idle);
                while let Some(result) = tasks.try_join_next() {
                    if let Err(e) = result {
                        error!("[epoch_monitor]: Group worker failed: {e}");
                    }
                }
                continue;
            }
            maybe = rx.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
        };

        let group_id = event.group_id.clone();
        let event = match workers.get_mut(&group_id) {
            Some(worker) => match worker.tx.send(event) {
                Ok(()) => {
                    worker.last_event = Instant::now();
                    continue;
                }
                // Worker died; respawn below with the same event.
                Err(mpsc::error::SendError(event)) => {
                    warn!("[epoch_monitor]: Worker for group {group_id} stopped, restarting");
                    event
                }
            },
            None => event,
        };

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        tasks.spawn(run_group_worker(
            group_id.clone(),
            worker_rx,
            handler.clone(),
            retiring.remove(&group_id),
            done.clone(),
            ActiveWorker::enter(&active_workers),
            cancel.clone(),
        ));
        if worker_tx.send(event).is_err() {
            error!("[epoch_monitor]: Fresh worker for group {group_id} rejected event");
        }
        workers.insert(
            group_id,
            GroupWorker {
                tx: worker_tx,
                last_event: Instant::now(),
                done,
            },
        );
    }

    drop(workers);
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("[epoch_monitor]: Group worker failed: {e}");
        }
    }
    info!("[epoch_monitor]: Stopped");
}

/// Drop the sender of every worker idle for `worker_idle`; the worker exits once drained.
fn release_idle_workers(
    workers: &mut HashMap<GroupId, GroupWorker>,
    retiring: &mut HashMap<GroupId, CancellationToken>,
    worker_idle: Duration,
) {
    retiring.retain(|_, done| !done.is_cancelled());

    let idle: Vec<GroupId> = workers
        .iter()
        .filter(|(_, worker)| worker.last_event.elapsed() >= worker_idle)
        .map(|(group_id, _)| group_id.clone())
        .collect();
    for group_id in idle {
        if let Some(worker) = workers.remove(&group_id) {
            debug!("[epoch_monitor]: Releasing idle worker for group {group_id}");
            retiring.insert(group_id, worker.done);
        }
    }
}

async fn run_group_worker(
    group_id: GroupId,
    mut rx: mpsc::UnboundedReceiver<EpochEvent>,
    handler: Arc<EpochEventHandler>,
    predecessor: Option<CancellationToken>,
    done: CancellationToken,
    _active: ActiveWorker,
    cancel: CancellationToken,
) {
    let _done = done.drop_guard();

    if let Some(predecessor) = predecessor {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = predecessor.cancelled() => {}
        }
    }

    let mut latest_epoch: Option<u64> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
        };

        // A decision computed from an older epoch must not overwrite a newer one.
        if latest_epoch.is_some_and(|latest| event.epoch < latest) {
            debug!(
                "[epoch_monitor]: Dropping stale epoch {} for group {group_id}",
                event.epoch
            );
            continue;
        }
        latest_epoch = Some(event.epoch);

        handler.handle(&event).await;
    }
}
