//! End-to-end tests of the wired engine on the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use identity_certs::{CertificateAuthority, CertificateStatus, CertificateValidator};
use uuid::Uuid;

use mls_trust::config::EngineConfig;
use mls_trust::core::{
    Conversation, ConversationId, ConversationKind, Device, DeviceId, EpochNotificationSource,
    GroupId, MigrationStatus, Protocol, QualifiedId, UserId, VerificationState,
};
use mls_trust::memory::{InMemoryBackend, RecordingNotificationSink};
use mls_trust::migration::{MigrationGate, TokioTaskHost};
use mls_trust::{Services, TrustEngine};

struct Setup {
    backend: Arc<InMemoryBackend>,
    sink: Arc<RecordingNotificationSink>,
    services: Services,
    alice: UserId,
    bob: UserId,
    team: Uuid,
}

fn setup(with_epochs: bool) -> Setup {
    let alice = UserId(QualifiedId::random("example.com"));
    let bob = UserId(QualifiedId::random("example.com"));
    let laptop = DeviceId("alice-laptop".into());
    let phone = DeviceId("bob-phone".into());
    let team = Uuid::new_v4();

    let backend = Arc::new(InMemoryBackend::new(alice.clone(), Some(laptop.clone())));
    backend.set_self_team(team).unwrap();
    backend.add_device(&alice, laptop.clone()).unwrap();
    backend.add_device(&bob, phone.clone()).unwrap();

    let mut authority = CertificateAuthority::generate();
    let now = Utc::now();
    for (device, user) in [(&laptop, &alice), (&phone, &bob)] {
        let cert = authority
            .issue_device(
                &device.0,
                &user.to_string(),
                now - TimeDelta::days(1),
                now + TimeDelta::days(30),
            )
            .unwrap();
        backend
            .set_certificate(device, cert.to_bytes().unwrap())
            .unwrap();
    }

    let sink = Arc::new(RecordingNotificationSink::new());
    let services = Services {
        conversations: backend.clone(),
        directory: backend.clone(),
        identities: backend.clone(),
        protocol_store: backend.clone(),
        groups: backend.clone(),
        policy: backend.clone(),
        epochs: with_epochs.then(|| backend.clone() as Arc<dyn EpochNotificationSource>),
        sink: sink.clone(),
        validator: Arc::new(CertificateValidator::new([authority.public_key_hex()])),
    };

    Setup {
        backend,
        sink,
        services,
        alice,
        bob,
        team,
    }
}

fn state_of(backend: &InMemoryBackend, id: &ConversationId) -> Option<Conversation> {
    backend.conversation_snapshot(id).unwrap()
}

#[tokio::test]
async fn engine_verifies_on_epoch_and_migrates_on_demand() {
    let s = setup(true);
    let group = GroupId("secure".into());
    s.backend
        .set_group_members(&group, vec![s.alice.clone(), s.bob.clone()])
        .unwrap();
    let secure = Conversation {
        id: ConversationId(QualifiedId::random("example.com")),
        name: "secure".into(),
        kind: ConversationKind::Group,
        team_id: Some(s.team),
        group_id: Some(group.clone()),
        protocol: Protocol::Secure,
        verification_state: VerificationState::Unverified,
        members: vec![s.alice.clone(), s.bob.clone()],
    };
    s.backend.insert_conversation(secure.clone()).unwrap();

    let host = TokioTaskHost::new();
    let (engine, gate) =
        TrustEngine::start(s.services.clone(), &EngineConfig::default(), &host).await;
    assert_eq!(gate, MigrationGate::SelfUnsupported);
    assert!(engine.is_monitoring());

    s.backend.advance_epoch(&group).await.unwrap();
    for _ in 0..200 {
        if state_of(&s.backend, &secure.id).map(|c| c.verification_state)
            == Some(VerificationState::Verified)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        state_of(&s.backend, &secure.id).unwrap().verification_state,
        VerificationState::Verified
    );
    assert!(engine
        .verified_devices()
        .is_verified(&DeviceId("bob-phone".into()))
        .await);

    let legacy = Conversation {
        id: ConversationId(QualifiedId::random("example.com")),
        name: "legacy".into(),
        kind: ConversationKind::Group,
        team_id: Some(s.team),
        group_id: None,
        protocol: Protocol::Legacy,
        verification_state: VerificationState::Unverified,
        members: vec![s.alice.clone(), s.bob.clone()],
    };
    s.backend.insert_conversation(legacy.clone()).unwrap();
    s.backend
        .set_supported_protocols(&s.alice, [Protocol::Legacy, Protocol::Secure])
        .unwrap();
    s.backend
        .set_migration_status(MigrationStatus::Started)
        .unwrap();

    let gate = engine.run_migration_pass().await;
    match gate {
        MigrationGate::Ran(report) => assert_eq!(report.finalised, vec![legacy.id.clone()]),
        other => panic!("unexpected gate: {other}"),
    }
    assert_eq!(
        state_of(&s.backend, &legacy.id).unwrap().protocol,
        Protocol::Secure
    );
    assert_eq!(s.sink.changes()[0].new_state, VerificationState::Verified);

    engine.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn engine_without_epoch_source_still_migrates() {
    let s = setup(false);
    s.backend
        .set_supported_protocols(&s.alice, [Protocol::Secure])
        .unwrap();
    s.backend
        .set_migration_status(MigrationStatus::Started)
        .unwrap();

    let host = TokioTaskHost::new();
    let (engine, gate) =
        TrustEngine::start(s.services.clone(), &EngineConfig::default(), &host).await;

    assert!(!engine.is_monitoring());
    assert!(matches!(gate, MigrationGate::Ran(_)));
    assert!(host.is_registered(mls_trust::migration::MIGRATION_TASK_KEY).await);

    engine.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn engine_applies_configured_expiry_warning() {
    let s = setup(false);
    let group = GroupId("warned".into());
    s.backend
        .set_group_members(&group, vec![s.alice.clone(), s.bob.clone()])
        .unwrap();
    let devices = [Device {
        id: DeviceId("bob-phone".into()),
        user_id: s.bob.clone(),
    }];

    let mut config = EngineConfig::default();
    config.verification.expiry_warning_days = 60;
    let host = TokioTaskHost::new();
    let (engine, _) = TrustEngine::start(s.services.clone(), &config, &host).await;

    // Certificates in the fixture expire in 30 days.
    let resolved = engine
        .state_machine()
        .resolver()
        .resolve(&group, &devices, Utc::now())
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, CertificateStatus::ExpiresSoon);
    engine.shutdown().await;

    let (engine, _) = TrustEngine::start(s.services.clone(), &EngineConfig::default(), &host).await;
    let resolved = engine
        .state_machine()
        .resolver()
        .resolve(&group, &devices, Utc::now())
        .await
        .unwrap();
    assert_eq!(resolved[0].status, CertificateStatus::Valid);

    engine.shutdown().await;
    host.shutdown().await;
}
