//! Per-conversation mutual exclusion.
//!
//! Verification (epoch events) and migration (scheduled passes) both mutate a conversation.
//! Each of them holds the conversation's lock for the whole read-decide-write sequence, so the
//! two never interleave on the same conversation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::types::ConversationId;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a conversation.
    pub async fn lock(&self, id: &ConversationId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.inner.lock().await;
            // Entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Number of conversations whose lock is held or awaited.
    ///
    /// Released entries are pruned lazily, on the next call to [`ConversationLocks::lock`].
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
