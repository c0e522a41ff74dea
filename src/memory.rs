//! In-memory backend implementing every consumed service.
//!
//! All data is lost on restart. Used by the demo binary and the integration tests; a real
//! deployment injects its own store, group service and policy source.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{
    Conversation, ConversationId, ConversationStore, DeviceId, EpochEvent,
    EpochNotificationSource, GroupEstablishment, GroupId, GroupLifecycleService, IdentityClaim,
    IdentityResolutionService, MigrationPolicySource, MigrationStatus, NotificationSink,
    Protocol, ProtocolStore, ServiceError, UserDirectory, UserId, VerificationChange,
    VerificationState,
};

#[derive(Clone, Debug, Default)]
struct GroupState {
    members: Vec<UserId>,
    epoch: u64,
}

struct BackendState {
    /// Insertion ordered.
    conversations: Vec<Conversation>,
    self_team: Option<Uuid>,
    devices: HashMap<UserId, Vec<DeviceId>>,
    certificates: HashMap<DeviceId, Vec<u8>>,
    groups: HashMap<GroupId, GroupState>,
    supported_protocols: HashMap<UserId, HashSet<Protocol>>,
    environment_supported: bool,
    migration_status: MigrationStatus,
    finalise_after: Option<DateTime<Utc>>,
    refreshes: u32,
    groups_created: u32,
}

/// In-memory conversation store, directory, group service and policy source for one client.
pub struct InMemoryBackend {
    self_user: UserId,
    local_device: Option<DeviceId>,
    state: RwLock<BackendState>,
    subscribers: Mutex<Vec<mpsc::Sender<EpochEvent>>>,
}

impl InMemoryBackend {
    pub fn new(self_user: UserId, local_device: Option<DeviceId>) -> Self {
        Self {
            self_user,
            local_device,
            state: RwLock::new(BackendState {
                conversations: Vec::new(),
                self_team: None,
                devices: HashMap::new(),
                certificates: HashMap::new(),
                groups: HashMap::new(),
                supported_protocols: HashMap::new(),
                environment_supported: true,
                migration_status: MigrationStatus::NotStarted,
                finalise_after: None,
                refreshes: 0,
                groups_created: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BackendState>, ServiceError> {
        self.state.read().map_err(|e| ServiceError::Backend(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BackendState>, ServiceError> {
        self.state.write().map_err(|e| ServiceError::Backend(e.to_string()))
    }

    // ─────────────────────────── Setup ───────────────────────────

    pub fn set_self_team(&self, team: Uuid) -> Result<(), ServiceError> {
        self.write()?.self_team = Some(team);
        Ok(())
    }

    /// Insert or replace a conversation.
    pub fn insert_conversation(&self, conversation: Conversation) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => state.conversations.push(conversation),
        }
        Ok(())
    }

    pub fn add_device(&self, user: &UserId, device: DeviceId) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        let devices = state.devices.entry(user.clone()).or_default();
        if !devices.contains(&device) {
            devices.push(device);
        }
        Ok(())
    }

    pub fn set_certificate(
        &self,
        device: &DeviceId,
        certificate: Vec<u8>,
    ) -> Result<(), ServiceError> {
        self.write()?.certificates.insert(device.clone(), certificate);
        Ok(())
    }

    pub fn remove_certificate(&self, device: &DeviceId) -> Result<(), ServiceError> {
        self.write()?.certificates.remove(device);
        Ok(())
    }

    pub fn set_supported_protocols(
        &self,
        user: &UserId,
        protocols: impl IntoIterator<Item = Protocol>,
    ) -> Result<(), ServiceError> {
        self.write()?
            .supported_protocols
            .insert(user.clone(), protocols.into_iter().collect());
        Ok(())
    }

    pub fn set_environment_supported(&self, supported: bool) -> Result<(), ServiceError> {
        self.write()?.environment_supported = supported;
        Ok(())
    }

    pub fn set_migration_status(&self, status: MigrationStatus) -> Result<(), ServiceError> {
        self.write()?.migration_status = status;
        Ok(())
    }

    pub fn set_finalise_regardless_after(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), ServiceError> {
        self.write()?.finalise_after = deadline;
        Ok(())
    }

    /// Create a group on behalf of a peer (or restore one), replacing its member list.
    pub fn set_group_members(
        &self,
        group_id: &GroupId,
        members: Vec<UserId>,
    ) -> Result<(), ServiceError> {
        self.write()?
            .groups
            .entry(group_id.clone())
            .or_default()
            .members = members;
        Ok(())
    }

    // ─────────────────────────── Inspection ───────────────────────────

    pub fn conversation_snapshot(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, ServiceError> {
        Ok(Self::conversation_in(&*self.read()?, id))
    }

    pub fn group_member_list(&self, group_id: &GroupId) -> Result<Vec<UserId>, ServiceError> {
        Ok(self
            .read()?
            .groups
            .get(group_id)
            .map(|g| g.members.clone())
            .unwrap_or_default())
    }

    pub fn epoch(&self, group_id: &GroupId) -> Result<u64, ServiceError> {
        Ok(self.read()?.groups.get(group_id).map_or(0, |g| g.epoch))
    }

    /// Groups created by the local client so far.
    pub fn groups_created(&self) -> Result<u32, ServiceError> {
        Ok(self.read()?.groups_created)
    }

    pub fn refresh_count(&self) -> Result<u32, ServiceError> {
        Ok(self.read()?.refreshes)
    }

    // ─────────────────────────── Epochs ───────────────────────────

    /// Advance the epoch of a group and notify subscribers. Returns the new epoch.
    pub async fn advance_epoch(&self, group_id: &GroupId) -> Result<u64, ServiceError> {
        let epoch = {
            let mut state = self.write()?;
            let group = state.groups.entry(group_id.clone()).or_default();
            group.epoch += 1;
            group.epoch
        };
        self.emit(EpochEvent {
            group_id: group_id.clone(),
            epoch,
        })
        .await;
        Ok(epoch)
    }

    /// Deliver an event as is, e.g. a duplicate or a late one.
    pub async fn emit(&self, event: EpochEvent) {
        let subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(e) => {
                warn!("[memory_backend]: Subscriber list poisoned: {e}");
                return;
            }
        };
        for subscriber in subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                debug!("[memory_backend]: Epoch subscriber closed");
            }
        }
    }

    /// Drop every subscription, closing the epoch streams.
    pub fn close_epoch_stream(&self) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.clear(),
            Err(e) => warn!("[memory_backend]: Subscriber list poisoned: {e}"),
        }
    }

    fn conversation_in(state: &BackendState, id: &ConversationId) -> Option<Conversation> {
        state.conversations.iter().find(|c| c.id == *id).cloned()
    }
}

#[async_trait]
impl ConversationStore for InMemoryBackend {
    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, ServiceError> {
        self.conversation_snapshot(id)
    }

    async fn conversation_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<Conversation>, ServiceError> {
        Ok(self
            .read()?
            .conversations
            .iter()
            .find(|c| c.group_id.as_ref() == Some(group_id))
            .cloned())
    }

    async fn group_conversations(&self) -> Result<Vec<Conversation>, ServiceError> {
        Ok(self
            .read()?
            .conversations
            .iter()
            .filter(|c| c.is_group())
            .cloned()
            .collect())
    }

    async fn self_team_group_conversations(&self) -> Result<Vec<Conversation>, ServiceError> {
        let state = self.read()?;
        let Some(team) = state.self_team else {
            return Ok(Vec::new());
        };
        Ok(state
            .conversations
            .iter()
            .filter(|c| c.is_group() && c.team_id == Some(team))
            .cloned()
            .collect())
    }

    async fn set_verification_state(
        &self,
        id: &ConversationId,
        verification_state: VerificationState,
    ) -> Result<(), ServiceError> {
        let mut state = self.write()?;
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        conversation.verification_state = verification_state;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemoryBackend {
    fn self_user(&self) -> UserId {
        self.self_user.clone()
    }

    fn local_device(&self) -> Option<DeviceId> {
        self.local_device.clone()
    }

    async fn devices(&self, user: &UserId) -> Result<Vec<DeviceId>, ServiceError> {
        let state = self.read()?;
        let mut devices = state.devices.get(user).cloned().unwrap_or_default();
        // The directory lists remote clients only; the local one is reported separately.
        if *user == self.self_user {
            devices.retain(|d| Some(d) != self.local_device.as_ref());
        }
        Ok(devices)
    }

    async fn refresh_known_users(&self) -> Result<(), ServiceError> {
        self.write()?.refreshes += 1;
        Ok(())
    }
}

#[async_trait]
impl IdentityResolutionService for InMemoryBackend {
    async fn resolve_identities(
        &self,
        group_id: &GroupId,
        device_owners: &HashMap<DeviceId, UserId>,
    ) -> Result<Vec<IdentityClaim>, ServiceError> {
        let state = self.read()?;
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| ServiceError::NotFound(format!("group {group_id}")))?;

        Ok(device_owners
            .iter()
            .filter(|(_, user)| group.members.contains(user))
            .filter_map(|(device, user)| {
                state.certificates.get(device).map(|certificate| IdentityClaim {
                    device_id: device.clone(),
                    user_id: user.clone(),
                    certificate: certificate.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl ProtocolStore for InMemoryBackend {
    async fn update_protocol(
        &self,
        conversation: &Conversation,
        target: Protocol,
    ) -> Result<Conversation, ServiceError> {
        let mut state = self.write()?;
        let stored = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
            .ok_or_else(|| ServiceError::NotFound(conversation.id.to_string()))?;

        if target < stored.protocol {
            return Err(ServiceError::Rejected(format!(
                "cannot move {} from {} to {target}",
                stored.id, stored.protocol
            )));
        }
        stored.protocol = target;
        if target >= Protocol::Transitional && stored.established_group_id().is_none() {
            stored.group_id = Some(GroupId(format!("group-{}", Uuid::new_v4())));
        }
        Ok(stored.clone())
    }
}

#[async_trait]
impl GroupLifecycleService for InMemoryBackend {
    async fn is_member(&self, group_id: &GroupId) -> Result<bool, ServiceError> {
        Ok(self
            .read()?
            .groups
            .get(group_id)
            .is_some_and(|g| g.members.contains(&self.self_user)))
    }

    async fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, ServiceError> {
        self.group_member_list(group_id)
    }

    async fn establish_or_join_group(
        &self,
        conversation: &Conversation,
    ) -> Result<GroupEstablishment, ServiceError> {
        let group_id = conversation
            .established_group_id()
            .cloned()
            .ok_or_else(|| ServiceError::Rejected(format!("{} has no group", conversation.id)))?;

        let (establishment, epoch) = {
            let mut state = self.write()?;
            let created = !state
                .groups
                .get(&group_id)
                .is_some_and(|g| !g.members.is_empty());
            if created {
                state.groups_created += 1;
            }
            let group = state.groups.entry(group_id.clone()).or_default();
            if !group.members.contains(&self.self_user) {
                group.members.push(self.self_user.clone());
            }
            group.epoch += 1;
            let establishment = if created {
                GroupEstablishment::Created
            } else {
                GroupEstablishment::Joined
            };
            (establishment, group.epoch)
        };

        self.emit(EpochEvent { group_id, epoch }).await;
        Ok(establishment)
    }

    async fn add_members(
        &self,
        conversation: &Conversation,
        members: &[UserId],
    ) -> Result<(), ServiceError> {
        let group_id = conversation
            .established_group_id()
            .cloned()
            .ok_or_else(|| ServiceError::Rejected(format!("{} has no group", conversation.id)))?;

        let epoch = {
            let mut state = self.write()?;
            let group = state
                .groups
                .get_mut(&group_id)
                .ok_or_else(|| ServiceError::NotFound(format!("group {group_id}")))?;
            for member in members {
                if !group.members.contains(member) {
                    group.members.push(member.clone());
                }
            }
            group.epoch += 1;
            group.epoch
        };

        self.emit(EpochEvent { group_id, epoch }).await;
        Ok(())
    }
}

#[async_trait]
impl MigrationPolicySource for InMemoryBackend {
    async fn is_secure_protocol_supported_by_environment(&self) -> bool {
        self.read().is_ok_and(|state| state.environment_supported)
    }

    async fn supported_protocols(&self, user: &UserId) -> Result<HashSet<Protocol>, ServiceError> {
        Ok(self
            .read()?
            .supported_protocols
            .get(user)
            .cloned()
            .unwrap_or_else(|| HashSet::from([Protocol::Legacy])))
    }

    async fn migration_status(&self) -> Result<MigrationStatus, ServiceError> {
        Ok(self.read()?.migration_status)
    }

    async fn finalise_regardless_after(&self) -> Result<Option<DateTime<Utc>>, ServiceError> {
        Ok(self.read()?.finalise_after)
    }
}

impl EpochNotificationSource for InMemoryBackend {
    fn subscribe(&self, sink: mpsc::Sender<EpochEvent>) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(sink),
            Err(e) => warn!("[memory_backend]: Subscriber list poisoned: {e}"),
        }
    }
}

/// Notification sink that records everything it receives.
#[derive(Default)]
pub struct RecordingNotificationSink {
    changes: Mutex<Vec<VerificationChange>>,
    alerts: Mutex<Vec<(ConversationId, u32)>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<VerificationChange> {
        self.changes
            .lock()
            .map(|changes| changes.clone())
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<(ConversationId, u32)> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn on_verification_state_changed(&self, change: VerificationChange) {
        match self.changes.lock() {
            Ok(mut changes) => changes.push(change),
            Err(e) => warn!("[recording_sink]: Change list poisoned: {e}"),
        }
    }

    async fn on_migration_retries_exhausted(&self, conversation: &ConversationId, failures: u32) {
        match self.alerts.lock() {
            Ok(mut alerts) => alerts.push((conversation.clone(), failures)),
            Err(e) => warn!("[recording_sink]: Alert list poisoned: {e}"),
        }
    }
}
