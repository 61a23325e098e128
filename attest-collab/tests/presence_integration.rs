//! Integration tests for the WebSocket gateway: real server, real clients,
//! presence fan-out, conflict round-trips over the wire.

use attest_collab::bus::ChangeEvent;
use attest_collab::client::{CollabClient, CollabEvent, ConnectionState};
use attest_collab::protocol::ErrorKind;
use attest_collab::record::{fields, ComplianceStatus, FieldUpdates, FieldValue, Requirement};
use attest_collab::server::{CollabServer, ServerConfig};
use attest_collab::service::{CollabConfig, CollabService};
use attest_collab::session::ActionKind;
use attest_collab::Resolution;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port; return the port and its service handle.
async fn start_test_server() -> (u16, Arc<CollabService>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        collab: CollabConfig::default(),
        storage_path: None,
    };
    let server = CollabServer::new(config).unwrap();
    let service = server.service().clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, service)
}

/// Connect a client for an org, draining the Connected + Snapshot events.
async fn connect_client(
    org: Uuid,
    actor: Uuid,
    port: u16,
) -> (CollabClient, mpsc::Receiver<CollabEvent>) {
    let mut client = CollabClient::new(org, actor, format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    expect_event(&mut events, |e| match e {
        CollabEvent::Connected => Some(()),
        _ => None,
    })
    .await;
    expect_event(&mut events, |e| match e {
        CollabEvent::Snapshot { .. } => Some(()),
        _ => None,
    })
    .await;

    (client, events)
}

/// Wait (with timeout) for the first event the picker accepts.
async fn expect_event<F, T>(events: &mut mpsc::Receiver<CollabEvent>, mut pick: F) -> T
where
    F: FnMut(&CollabEvent) -> Option<T>,
{
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if let Some(value) = pick(&event) {
            return value;
        }
    }
}

fn status(value: ComplianceStatus) -> FieldUpdates {
    let mut updates = FieldUpdates::new();
    updates.insert(fields::STATUS.into(), FieldValue::Status(value));
    updates
}

fn notes(text: &str) -> FieldUpdates {
    let mut updates = FieldUpdates::new();
    updates.insert(fields::NOTES.into(), FieldValue::Text(text.into()));
    updates
}

async fn seed_record(service: &Arc<CollabService>, org: Uuid) -> Requirement {
    service
        .create_record(org, Uuid::new_v4(), status(ComplianceStatus::NotFulfilled))
        .await
        .unwrap()
}

// ─── Connection lifecycle ────────────────────────────────────────

#[tokio::test]
async fn test_client_connects_and_snapshots() {
    let (port, _service) = start_test_server().await;
    let org = Uuid::new_v4();

    let (client, _events) = connect_client(org, Uuid::new_v4(), port).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn test_snapshot_carries_existing_presence() {
    let (port, service) = start_test_server().await;
    let org = Uuid::new_v4();

    // Presence established before the client connects.
    let session = service
        .start_collaboration(org, None, Uuid::new_v4(), ActionKind::Viewing)
        .await
        .unwrap();

    let mut client = CollabClient::new(org, Uuid::new_v4(), format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let sessions = expect_event(&mut events, |e| match e {
        CollabEvent::Snapshot { sessions, .. } => Some(sessions.clone()),
        _ => None,
    })
    .await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session.id);
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, _service) = start_test_server().await;
    let (client, mut events) = connect_client(Uuid::new_v4(), Uuid::new_v4(), port).await;

    client.ping().await.unwrap();
    expect_event(&mut events, |e| match e {
        CollabEvent::Pong => Some(()),
        _ => None,
    })
    .await;
}

// ─── Presence fan-out ────────────────────────────────────────────

#[tokio::test]
async fn test_session_open_broadcasts_to_peers() {
    let (port, _service) = start_test_server().await;
    let org = Uuid::new_v4();
    let actor_a = Uuid::new_v4();

    let (client_a, mut events_a) = connect_client(org, actor_a, port).await;
    let (_client_b, mut events_b) = connect_client(org, Uuid::new_v4(), port).await;

    client_a.open_session(None, ActionKind::Editing).await.unwrap();

    // A gets the direct reply.
    let session = expect_event(&mut events_a, |e| match e {
        CollabEvent::SessionOpened { session } => Some(session.clone()),
        _ => None,
    })
    .await;
    assert_eq!(session.actor_id, actor_a);

    // B gets the pushed presence transition.
    let started = expect_event(&mut events_b, |e| match e {
        CollabEvent::Change {
            event: ChangeEvent::SessionStarted { session, .. },
        } => Some(session.clone()),
        _ => None,
    })
    .await;
    assert_eq!(started.id, session.id);
}

#[tokio::test]
async fn test_session_close_broadcasts_end() {
    let (port, _service) = start_test_server().await;
    let org = Uuid::new_v4();

    let (client_a, mut events_a) = connect_client(org, Uuid::new_v4(), port).await;
    let (_client_b, mut events_b) = connect_client(org, Uuid::new_v4(), port).await;

    client_a.open_session(None, ActionKind::Viewing).await.unwrap();
    let session = expect_event(&mut events_a, |e| match e {
        CollabEvent::SessionOpened { session } => Some(session.clone()),
        _ => None,
    })
    .await;

    client_a.close_session(session.id).await.unwrap();
    let ended = expect_event(&mut events_b, |e| match e {
        CollabEvent::Change {
            event: ChangeEvent::SessionEnded { session, .. },
        } => Some(session.clone()),
        _ => None,
    })
    .await;
    assert_eq!(ended.id, session.id);
}

#[tokio::test]
async fn test_heartbeat_for_unknown_session_errors() {
    let (port, _service) = start_test_server().await;
    let (client, mut events) = connect_client(Uuid::new_v4(), Uuid::new_v4(), port).await;

    client.heartbeat(Uuid::new_v4()).await.unwrap();
    let kind = expect_event(&mut events, |e| match e {
        CollabEvent::ServerError { kind, .. } => Some(*kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::SessionExpired);
}

// ─── Writes and conflicts over the wire ──────────────────────────

#[tokio::test]
async fn test_commit_fans_out_to_peers() {
    let (port, service) = start_test_server().await;
    let org = Uuid::new_v4();
    let record = seed_record(&service, org).await;

    let (client_a, mut events_a) = connect_client(org, Uuid::new_v4(), port).await;
    let (_client_b, mut events_b) = connect_client(org, Uuid::new_v4(), port).await;

    client_a
        .write(record.id, 0, status(ComplianceStatus::Fulfilled))
        .await
        .unwrap();

    // Direct reply to the writer.
    let committed = expect_event(&mut events_a, |e| match e {
        CollabEvent::Committed { record } => Some(record.clone()),
        _ => None,
    })
    .await;
    assert_eq!(committed.version, 1);

    // Pushed commit to the peer, carrying the full new record.
    let pushed = expect_event(&mut events_b, |e| match e {
        CollabEvent::Change {
            event: ChangeEvent::Committed { record, .. },
        } => Some(record.clone()),
        _ => None,
    })
    .await;
    assert_eq!(pushed.version, 1);
    assert_eq!(
        pushed.field(fields::STATUS),
        Some(&FieldValue::Status(ComplianceStatus::Fulfilled))
    );
}

#[tokio::test]
async fn test_conflict_and_keep_local_resolution_over_wire() {
    let (port, service) = start_test_server().await;
    let org = Uuid::new_v4();
    let record = seed_record(&service, org).await;

    let (client_a, mut events_a) = connect_client(org, Uuid::new_v4(), port).await;
    let (client_b, mut events_b) = connect_client(org, Uuid::new_v4(), port).await;

    // A commits at the shared base version.
    client_a
        .write(record.id, 0, status(ComplianceStatus::Fulfilled))
        .await
        .unwrap();
    expect_event(&mut events_a, |e| match e {
        CollabEvent::Committed { .. } => Some(()),
        _ => None,
    })
    .await;

    // B writes from the same stale base and gets the conflict payload.
    client_b.write(record.id, 0, notes("see attached")).await.unwrap();
    let conflict = expect_event(&mut events_b, |e| match e {
        CollabEvent::Conflict { conflict } => Some(conflict.clone()),
        _ => None,
    })
    .await;
    assert_eq!(conflict.remote.version, 1);
    assert_eq!(conflict.expected_version, 0);

    // B resolves keep_local; the retry lands both edits at version 2.
    client_b
        .resolve(record.id, Resolution::KeepLocal)
        .await
        .unwrap();
    let resolved = expect_event(&mut events_b, |e| match e {
        CollabEvent::Resolved { record } => Some(record.clone()),
        _ => None,
    })
    .await;
    assert_eq!(resolved.version, 2);
    assert_eq!(
        resolved.field(fields::STATUS),
        Some(&FieldValue::Status(ComplianceStatus::Fulfilled))
    );
    assert_eq!(
        resolved.field(fields::NOTES),
        Some(&FieldValue::Text("see attached".into()))
    );
}

#[tokio::test]
async fn test_validation_failure_is_not_a_conflict() {
    let (port, service) = start_test_server().await;
    let org = Uuid::new_v4();
    let record = seed_record(&service, org).await;

    let (client, mut events) = connect_client(org, Uuid::new_v4(), port).await;

    // A mistyped status is rejected before the CAS — distinct error kind.
    let mut bad = FieldUpdates::new();
    bad.insert(fields::STATUS.into(), FieldValue::Text("done".into()));
    client.write(record.id, 0, bad).await.unwrap();

    let kind = expect_event(&mut events, |e| match e {
        CollabEvent::ServerError { kind, .. } => Some(*kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Validation);
}

#[tokio::test]
async fn test_cross_org_write_denied() {
    let (port, service) = start_test_server().await;
    let record = seed_record(&service, Uuid::new_v4()).await;

    // Client subscribed to a different organization.
    let (client, mut events) = connect_client(Uuid::new_v4(), Uuid::new_v4(), port).await;
    client
        .write(record.id, 0, status(ComplianceStatus::Fulfilled))
        .await
        .unwrap();

    let kind = expect_event(&mut events, |e| match e {
        CollabEvent::ServerError { kind, .. } => Some(*kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::AuthorizationDenied);
}

#[tokio::test]
async fn test_events_isolated_between_orgs() {
    let (port, service) = start_test_server().await;
    let org_a = Uuid::new_v4();
    let org_b = Uuid::new_v4();
    let record_a = seed_record(&service, org_a).await;

    let (client_a, mut events_a) = connect_client(org_a, Uuid::new_v4(), port).await;
    let (_client_b, mut events_b) = connect_client(org_b, Uuid::new_v4(), port).await;

    client_a
        .write(record_a.id, 0, status(ComplianceStatus::Fulfilled))
        .await
        .unwrap();
    expect_event(&mut events_a, |e| match e {
        CollabEvent::Committed { .. } => Some(()),
        _ => None,
    })
    .await;

    // B (other org) must see nothing within a grace period.
    let leaked = timeout(Duration::from_millis(300), events_b.recv()).await;
    assert!(leaked.is_err(), "events must not cross organizations: {leaked:?}");
}
