//! Demo: runs the trust engine against the in-memory backend.
//!
//! Walks a two-member conversation through Verified → Degraded → Verified, then migrates a
//! legacy team conversation to the secure protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as TimeDelta, Utc};
use identity_certs::{CertificateAuthority, CertificateValidator};
use tracing::info;
use uuid::Uuid;

use mls_trust::config::EngineConfig;
use mls_trust::core::{
    Conversation, ConversationId, ConversationKind, DeviceId, GroupId, MigrationStatus,
    Protocol, QualifiedId, UserId, VerificationState,
};
use mls_trust::logging::init_logging;
use mls_trust::memory::{InMemoryBackend, RecordingNotificationSink};
use mls_trust::migration::TokioTaskHost;
use mls_trust::{Services, TrustEngine};

const DOMAIN: &str = "example.com";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");
    let config = EngineConfig::from_env().context("Failed to load engine config")?;

    let mut authority = CertificateAuthority::generate();
    let validator = Arc::new(CertificateValidator::new([authority.public_key_hex()]));

    let alice = UserId(QualifiedId::random(DOMAIN));
    let bob = UserId(QualifiedId::random(DOMAIN));
    let alice_laptop = DeviceId("alice-laptop".into());
    let bob_phone = DeviceId("bob-phone".into());

    let backend = Arc::new(InMemoryBackend::new(alice.clone(), Some(alice_laptop.clone())));
    let team = Uuid::new_v4();
    backend.set_self_team(team)?;
    backend.add_device(&alice, alice_laptop.clone())?;
    backend.add_device(&bob, bob_phone.clone())?;

    let now = Utc::now();
    for (device, user) in [(&alice_laptop, &alice), (&bob_phone, &bob)] {
        let cert = authority.issue_device(
            &device.0,
            &user.to_string(),
            now - TimeDelta::days(1),
            now + TimeDelta::days(90),
        )?;
        backend.set_certificate(device, cert.to_bytes()?)?;
    }

    let secure_group = GroupId("demo-secure".into());
    let secure = Conversation {
        id: ConversationId(QualifiedId::random(DOMAIN)),
        name: "design review".into(),
        kind: ConversationKind::Group,
        team_id: Some(team),
        group_id: Some(secure_group.clone()),
        protocol: Protocol::Secure,
        verification_state: VerificationState::Unverified,
        members: vec![alice.clone(), bob.clone()],
    };
    backend.insert_conversation(secure.clone())?;
    backend.set_group_members(&secure_group, vec![alice.clone(), bob.clone()])?;

    let sink = Arc::new(RecordingNotificationSink::new());
    let services = Services {
        conversations: backend.clone(),
        directory: backend.clone(),
        identities: backend.clone(),
        protocol_store: backend.clone(),
        groups: backend.clone(),
        policy: backend.clone(),
        epochs: Some(backend.clone()),
        sink: sink.clone(),
        validator,
    };
    let host = TokioTaskHost::new();
    let (engine, gate) = TrustEngine::start(services, &config, &host).await;
    info!("[demo]: Migration gate at start: {gate}");

    // ─── Verification ───

    backend.advance_epoch(&secure_group).await?;
    wait_for_state(&backend, &secure.id, VerificationState::Verified).await?;

    let expired = authority.issue_device(
        &bob_phone.0,
        &bob.to_string(),
        now - TimeDelta::days(30),
        now - TimeDelta::days(1),
    )?;
    backend.set_certificate(&bob_phone, expired.to_bytes()?)?;
    backend.advance_epoch(&secure_group).await?;
    wait_for_state(&backend, &secure.id, VerificationState::Degraded).await?;

    let reissued = authority.issue_device(
        &bob_phone.0,
        &bob.to_string(),
        now - TimeDelta::days(1),
        now + TimeDelta::days(90),
    )?;
    backend.set_certificate(&bob_phone, reissued.to_bytes()?)?;
    backend.advance_epoch(&secure_group).await?;
    wait_for_state(&backend, &secure.id, VerificationState::Verified).await?;

    for change in sink.changes() {
        info!(
            "[demo]: {} -> {} ({}), affected: {:?}",
            change.previous_state,
            change.new_state,
            change.reason,
            change
                .affected_users
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
    }
    info!(
        "[demo]: Verified devices: {:?}",
        engine.verified_devices().snapshot().await
    );

    // ─── Migration ───

    let legacy = Conversation {
        id: ConversationId(QualifiedId::random(DOMAIN)),
        name: "all hands".into(),
        kind: ConversationKind::Group,
        team_id: Some(team),
        group_id: None,
        protocol: Protocol::Legacy,
        verification_state: VerificationState::Unverified,
        members: vec![alice.clone(), bob.clone()],
    };
    backend.insert_conversation(legacy.clone())?;
    backend.set_supported_protocols(&alice, [Protocol::Legacy, Protocol::Secure])?;
    backend.set_migration_status(MigrationStatus::Started)?;

    let gate = engine.run_migration_pass().await;
    info!("[demo]: Migration pass: {gate}");
    let migrated = backend
        .conversation_snapshot(&legacy.id)?
        .context("Migrated conversation disappeared")?;
    info!(
        "[demo]: Conversation {} is now on the {} protocol",
        migrated.name, migrated.protocol
    );

    engine.shutdown().await;
    host.shutdown().await;
    Ok(())
}

async fn wait_for_state(
    backend: &InMemoryBackend,
    id: &ConversationId,
    expected: VerificationState,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        let current = backend
            .conversation_snapshot(id)?
            .map(|c| c.verification_state);
        if current == Some(expected) {
            info!("[demo]: Conversation {id} is {expected}");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("Conversation {id} never reached {expected}")
}
