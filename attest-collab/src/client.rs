//! WebSocket client for the collaboration gateway.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Fire-and-forget requests with replies delivered as events
//! - A `connected` liveness flag via `ConnectionState`
//!
//! There is deliberately no offline queue: a write attempted while
//! disconnected fails immediately, and a reconnect yields a fresh snapshot
//! rather than a replay of missed events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::bus::ChangeEvent;
use crate::conflict::{ConflictRecord, Resolution};
use crate::feed::ActivityEvent;
use crate::protocol::{ClientRequest, ErrorKind, ProtocolError, ServerMessage};
use crate::record::{FieldUpdates, Requirement};
use crate::session::{ActionKind, Session};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the embedding UI.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established and subscription placed.
    Connected,
    /// Connection lost; reconnect for a fresh snapshot.
    Disconnected,
    /// Presence + feed snapshot as of subscribe time.
    Snapshot {
        sessions: Vec<Session>,
        events: Vec<ActivityEvent>,
    },
    SessionOpened { session: Session },
    SessionClosed { session_id: Uuid },
    RecordCreated { record: Requirement },
    /// Our write committed.
    Committed { record: Requirement },
    /// Our write hit a version conflict; resolution required.
    Conflict { conflict: ConflictRecord },
    /// Our resolution applied.
    Resolved { record: Requirement },
    /// Our resolution lost another race; a fresh conflict is pending.
    ResolveConflict { conflict: ConflictRecord },
    /// Pushed change-stream event from the organization.
    Change { event: ChangeEvent },
    ServerError { kind: ErrorKind, message: String },
    Pong,
}

/// The collaboration client.
pub struct CollabClient {
    org_id: Uuid,
    actor_id: Uuid,
    /// Record to scope the subscription to (None = whole organization).
    target_id: Option<Uuid>,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task.
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application.
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    /// Event sender (held by the reader task).
    event_tx: mpsc::Sender<CollabEvent>,

    /// Running heartbeat loops by session id.
    heartbeats: Arc<Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>>,
}

impl CollabClient {
    pub fn new(org_id: Uuid, actor_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            org_id,
            actor_id,
            target_id: None,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Scope the subscription to one record.
    pub fn with_target(mut self, target_id: Uuid) -> Self {
        self.target_id = Some(target_id);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect and subscribe.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.establish(ConnectionState::Connecting).await
    }

    /// Reconnect after a drop. The server answers the fresh subscription
    /// with a new snapshot — missed events are not replayed.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.establish(ConnectionState::Reconnecting).await
    }

    async fn establish(&mut self, via: ConnectionState) -> Result<(), ProtocolError> {
        *self.state.write().await = via;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Place the subscription before anything else.
        let subscribe = ClientRequest::Subscribe {
            org_id: self.org_id,
            target_id: self.target_id,
        };
        let encoded = subscribe.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Reader task: map server frames to application events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(frame) => {
                                let event = Self::map_frame(frame);
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost.
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        Ok(())
    }

    fn map_frame(frame: ServerMessage) -> CollabEvent {
        match frame {
            ServerMessage::Subscribed { sessions, events } => {
                CollabEvent::Snapshot { sessions, events }
            }
            ServerMessage::SessionOpened { session } => CollabEvent::SessionOpened { session },
            ServerMessage::SessionClosed { session_id } => {
                CollabEvent::SessionClosed { session_id }
            }
            ServerMessage::RecordCreated { record } => CollabEvent::RecordCreated { record },
            ServerMessage::WriteCommitted { record } => CollabEvent::Committed { record },
            ServerMessage::WriteConflict { conflict } => CollabEvent::Conflict { conflict },
            ServerMessage::Resolved { record } => CollabEvent::Resolved { record },
            ServerMessage::ResolveConflict { conflict } => {
                CollabEvent::ResolveConflict { conflict }
            }
            ServerMessage::Event { event } => CollabEvent::Change { event },
            ServerMessage::Error { kind, message } => CollabEvent::ServerError { kind, message },
            ServerMessage::Pong => CollabEvent::Pong,
        }
    }

    /// Send one request frame. Fails immediately when not connected.
    async fn send(&self, request: ClientRequest) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = request.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Open a presence session; the reply arrives as `SessionOpened`.
    pub async fn open_session(
        &self,
        target_id: Option<Uuid>,
        action: ActionKind,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::OpenSession {
            org_id: self.org_id,
            target_id,
            actor_id: self.actor_id,
            action,
        })
        .await
    }

    /// Send one heartbeat for a session.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Heartbeat { session_id }).await
    }

    /// Heartbeat a session on an interval until it is closed or the
    /// connection drops.
    pub fn spawn_heartbeat(&self, session_id: Uuid, interval: Duration) -> bool {
        let Some(tx) = self.outgoing_tx.clone() else {
            return false;
        };
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let frame = ClientRequest::Heartbeat { session_id };
                let Ok(encoded) = frame.encode() else { break };
                if tx.send(encoded).await.is_err() {
                    break;
                }
            }
        });
        self.heartbeats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, handle);
        true
    }

    /// Close a session, cancelling its heartbeat loop.
    pub async fn close_session(&self, session_id: Uuid) -> Result<(), ProtocolError> {
        if let Some(handle) = self
            .heartbeats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id)
        {
            handle.abort();
        }
        self.send(ClientRequest::CloseSession { session_id }).await
    }

    /// Create a record; the reply arrives as `RecordCreated`.
    pub async fn create_record(&self, fields: FieldUpdates) -> Result<(), ProtocolError> {
        self.send(ClientRequest::CreateRecord {
            org_id: self.org_id,
            actor_id: self.actor_id,
            fields,
        })
        .await
    }

    /// Issue a conflict-detected write; the reply arrives as `Committed` or
    /// `Conflict`.
    pub async fn write(
        &self,
        record_id: Uuid,
        expected_version: u64,
        updates: FieldUpdates,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Write {
            org_id: self.org_id,
            record_id,
            expected_version,
            actor_id: self.actor_id,
            updates,
        })
        .await
    }

    /// Resolve a pending conflict; the reply arrives as `Resolved` or
    /// `ResolveConflict`.
    pub async fn resolve(
        &self,
        record_id: Uuid,
        resolution: Resolution,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Resolve {
            org_id: self.org_id,
            record_id,
            actor_id: self.actor_id,
            resolution,
        })
        .await
    }

    /// Re-place the subscription on an existing connection (after the server
    /// reported `SubscriptionDisconnected`). Yields a fresh snapshot.
    pub async fn resubscribe(&self) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Subscribe {
            org_id: self.org_id,
            target_id: self.target_id,
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Ping).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Liveness flag for the subscription/connection.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub fn org_id(&self) -> Uuid {
        self.org_id
    }

    pub fn actor_id(&self) -> Uuid {
        self.actor_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, ComplianceStatus, FieldValue};

    #[test]
    fn test_client_creation() {
        let org = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let client = CollabClient::new(org, actor, "ws://localhost:9440");

        assert_eq!(client.org_id(), org);
        assert_eq!(client.actor_id(), actor);
        assert_eq!(client.server_url(), "ws://localhost:9440");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CollabClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9440");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = CollabClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9440");

        let mut updates = FieldUpdates::new();
        updates.insert(
            fields::STATUS.into(),
            FieldValue::Status(ComplianceStatus::Fulfilled),
        );

        // No offline queue: the write fails instead of queueing.
        let result = client.write(Uuid::new_v4(), 0, updates).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));

        let result = client.open_session(None, ActionKind::Viewing).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_spawn_heartbeat_requires_connection() {
        let client = CollabClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9440");
        assert!(!client.spawn_heartbeat(Uuid::new_v4(), Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = CollabClient::new(Uuid::new_v4(), Uuid::new_v4(), "ws://localhost:9440");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}
