//! Resolution of device identities inside a security group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use identity_certs::{Certificate, CertificateStatus, CertificateValidator};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::{
    Device, DeviceId, GroupId, IdentityClaim, IdentityResolutionService, ServiceError, UserId,
};

/// Devices that have presented a trustworthy certificate at least once.
///
/// Positive-only: entries are added by [`DeviceIdentityResolver`] and never removed here.
/// Conversation-level trust is owned by the verification state machine; this is a read-only
/// projection for consumers that display per-device badges.
#[derive(Clone, Default)]
pub struct VerifiedDevices {
    inner: Arc<RwLock<HashSet<DeviceId>>>,
}

impl VerifiedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_verified(&self, device: &DeviceId) -> bool {
        self.inner.read().await.contains(device)
    }

    pub async fn snapshot(&self) -> HashSet<DeviceId> {
        self.inner.read().await.clone()
    }

    async fn mark_verified(&self, device: DeviceId) {
        self.inner.write().await.insert(device);
    }
}

/// Identity claim together with the validation verdict for its certificate.
#[derive(Clone, Debug)]
pub struct ResolvedIdentity {
    pub claim: IdentityClaim,
    pub status: CertificateStatus,
}

impl ResolvedIdentity {
    pub fn is_trusted(&self) -> bool {
        self.status.is_trustworthy()
    }
}

pub struct DeviceIdentityResolver {
    service: Arc<dyn IdentityResolutionService>,
    validator: Arc<CertificateValidator>,
    verified: VerifiedDevices,
}

impl DeviceIdentityResolver {
    pub fn new(
        service: Arc<dyn IdentityResolutionService>,
        validator: Arc<CertificateValidator>,
        verified: VerifiedDevices,
    ) -> Self {
        Self {
            service,
            validator,
            verified,
        }
    }

    pub fn verified_devices(&self) -> &VerifiedDevices {
        &self.verified
    }

    /// Resolve the identities of `devices` within `group_id`.
    ///
    /// Lookups fan out per user and are all awaited before anything is returned. A device
    /// missing from the result could not be resolved. Any failed lookup fails the whole call,
    /// since a partial answer cannot prove every device trustworthy.
    pub async fn resolve(
        &self,
        group_id: &GroupId,
        devices: &[Device],
        now: DateTime<Utc>,
    ) -> Result<Vec<ResolvedIdentity>, ServiceError> {
        let mut by_user: HashMap<&UserId, HashMap<DeviceId, UserId>> = HashMap::new();
        for device in devices {
            by_user
                .entry(&device.user_id)
                .or_default()
                .insert(device.id.clone(), device.user_id.clone());
        }

        let lookups = by_user
            .values()
            .map(|owners| self.service.resolve_identities(group_id, owners));
        let claims = join_all(lookups)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten();

        let requested: HashMap<&DeviceId, &UserId> =
            devices.iter().map(|d| (&d.id, &d.user_id)).collect();
        let mut resolved: HashMap<DeviceId, ResolvedIdentity> = HashMap::new();

        for claim in claims {
            match requested.get(&claim.device_id) {
                Some(owner) if **owner == claim.user_id => {}
                _ => {
                    warn!(
                        "[resolve]: Ignoring unrequested claim for device {} of {} in group {group_id}",
                        claim.device_id, claim.user_id
                    );
                    continue;
                }
            }

            let status = self.certificate_status(&claim, now);
            debug!(
                "[resolve]: Device {} of {} in group {group_id}: {status}",
                claim.device_id, claim.user_id
            );

            let keep_existing = resolved
                .get(&claim.device_id)
                .is_some_and(ResolvedIdentity::is_trusted);
            if !keep_existing {
                resolved.insert(claim.device_id.clone(), ResolvedIdentity { claim, status });
            }
        }

        for identity in resolved.values().filter(|r| r.is_trusted()) {
            self.verified
                .mark_verified(identity.claim.device_id.clone())
                .await;
        }

        Ok(resolved.into_values().collect())
    }

    fn certificate_status(&self, claim: &IdentityClaim, now: DateTime<Utc>) -> CertificateStatus {
        let certificate = match Certificate::from_bytes(&claim.certificate) {
            Ok(certificate) => certificate,
            Err(e) => return CertificateStatus::Invalid(e.to_string()),
        };
        if !certificate.is_bound_to(&claim.device_id.0, &claim.user_id.to_string()) {
            return CertificateStatus::Invalid("certificate bound to another device".to_string());
        }
        self.validator.validate_certificate(&certificate, now)
    }
}
