//! WebSocket collaboration gateway.
//!
//! Architecture:
//! ```text
//! UI client A ──┐
//!               ├── CollabServer ── CollabService ── RecordStore (CAS)
//! UI client B ──┘         │               │
//!                         │               ├── SessionRegistry (presence)
//!                         │               ├── ConflictResolver
//!                         │               └── ActivityFeed ─► ChangeBus
//!                         │                                      │
//!                         └── pushed Event frames ◄──────────────┘
//! ```
//!
//! One WebSocket connection per UI session. The connection subscribes to its
//! organization's change stream and receives pushed events; its own calls are
//! request/response frames. Sessions opened over a connection are ended when
//! the connection drops — the guaranteed exit path; abrupt losses are
//! recovered by the liveness sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::Subscription;
use crate::protocol::{ClientRequest, ServerMessage};
use crate::service::{
    CollabConfig, CollabError, CollabService, ResolveOutcome, UpdateOutcome,
};
use crate::store::{MemoryStore, RecordStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Collaboration service tuning (liveness window, sweep, buffers)
    pub collab: CollabConfig,
    /// Durable storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9440".to_string(),
            collab: CollabConfig::default(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The collaboration gateway.
pub struct CollabServer {
    config: ServerConfig,
    service: Arc<CollabService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server, opening durable storage when configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn RecordStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already-opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RecordStore>) -> Self {
        let service = Arc::new(CollabService::new(store, config.collab.clone()));
        Self {
            config,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The underlying service (for embedding and tests).
    pub fn service(&self) -> &Arc<CollabService> {
        &self.service
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Run the accept loop. Recovers the durable feed and starts the
    /// liveness sweeper first.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.service.recover()?;
        if recovered > 0 {
            log::info!("Recovered {recovered} activity events");
        }
        let _sweeper = self.service.spawn_sweeper();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats.clone()).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                let mut s = stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<CollabService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state.
        let mut subscription: Option<Subscription> = None;
        let mut opened_sessions: Vec<Uuid> = Vec::new();

        loop {
            tokio::select! {
                // Incoming request frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let request = match ClientRequest::decode(&bytes) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            let reply = Self::handle_request(
                                request,
                                &service,
                                &mut subscription,
                                &mut opened_sessions,
                            )
                            .await;

                            if let Some(frame) = reply {
                                let encoded = frame.encode()?;
                                ws_sender.send(Message::Binary(encoded.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Pushed change-stream event
                event = async {
                    match subscription.as_mut() {
                        Some(sub) => sub.next().await,
                        // No subscription yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(change) => {
                            let frame = ServerMessage::Event {
                                event: (*change).clone(),
                            };
                            let encoded = frame.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        None => {
                            // Lagged or bus torn down: the stream can no
                            // longer be delivered gap-free. Tell the client
                            // to resubscribe for a fresh snapshot.
                            let frame = ServerMessage::error(&CollabError::SubscriptionDisconnected);
                            let encoded = frame.encode()?;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                            subscription = None;
                        }
                    }
                }
            }
        }

        // Teardown: end every session this connection opened. Presence is
        // connection-scoped; in-flight writes are not.
        for session_id in opened_sessions {
            let _ = service.end_collaboration(session_id).await;
        }

        Ok(())
    }

    /// Dispatch one request. Returns the reply frame, if any.
    async fn handle_request(
        request: ClientRequest,
        service: &Arc<CollabService>,
        subscription: &mut Option<Subscription>,
        opened_sessions: &mut Vec<Uuid>,
    ) -> Option<ServerMessage> {
        match request {
            ClientRequest::Subscribe { org_id, target_id } => {
                match service.subscribe(org_id, target_id).await {
                    Ok(sub) => {
                        let reply = ServerMessage::Subscribed {
                            sessions: sub.active_sessions.clone(),
                            events: sub.recent_events.clone(),
                        };
                        *subscription = Some(sub);
                        Some(reply)
                    }
                    Err(e) => Some(ServerMessage::error(&e)),
                }
            }

            ClientRequest::OpenSession {
                org_id,
                target_id,
                actor_id,
                action,
            } => match service
                .start_collaboration(org_id, target_id, actor_id, action)
                .await
            {
                Ok(session) => {
                    opened_sessions.push(session.id);
                    Some(ServerMessage::SessionOpened { session })
                }
                Err(e) => Some(ServerMessage::error(&e)),
            },

            ClientRequest::Heartbeat { session_id } => {
                // Fire-and-forget unless it failed.
                match service.heartbeat(session_id).await {
                    Ok(()) => None,
                    Err(e) => Some(ServerMessage::error(&e)),
                }
            }

            ClientRequest::CloseSession { session_id } => {
                match service.end_collaboration(session_id).await {
                    Ok(()) => {
                        opened_sessions.retain(|id| *id != session_id);
                        Some(ServerMessage::SessionClosed { session_id })
                    }
                    Err(e) => Some(ServerMessage::error(&e)),
                }
            }

            ClientRequest::CreateRecord {
                org_id,
                actor_id,
                fields,
            } => match service.create_record(org_id, actor_id, fields).await {
                Ok(record) => Some(ServerMessage::RecordCreated { record }),
                Err(e) => Some(ServerMessage::error(&e)),
            },

            ClientRequest::Write {
                org_id,
                record_id,
                expected_version,
                actor_id,
                updates,
            } => match service
                .update_with_conflict_detection(org_id, record_id, updates, expected_version, actor_id)
                .await
            {
                Ok(UpdateOutcome::Committed { record }) => {
                    Some(ServerMessage::WriteCommitted { record })
                }
                Ok(UpdateOutcome::Conflict(conflict)) => {
                    Some(ServerMessage::WriteConflict { conflict })
                }
                Err(e) => Some(ServerMessage::error(&e)),
            },

            ClientRequest::Resolve {
                org_id,
                record_id,
                actor_id,
                resolution,
            } => match service
                .resolve_conflict(org_id, record_id, actor_id, resolution)
                .await
            {
                Ok(ResolveOutcome::Resolved { record }) => {
                    Some(ServerMessage::Resolved { record })
                }
                Ok(ResolveOutcome::Conflict(conflict)) => {
                    Some(ServerMessage::ResolveConflict { conflict })
                }
                Err(e) => Some(ServerMessage::error(&e)),
            },

            ClientRequest::Ping => Some(ServerMessage::Pong),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9440");
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9440");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        assert_eq!(server.service().recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_handle_request_ping() {
        let server = CollabServer::with_defaults();
        let mut subscription = None;
        let mut opened = Vec::new();

        let reply = CollabServer::handle_request(
            ClientRequest::Ping,
            server.service(),
            &mut subscription,
            &mut opened,
        )
        .await;
        assert_eq!(reply, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_handle_request_subscribe_and_open() {
        let server = CollabServer::with_defaults();
        let mut subscription = None;
        let mut opened = Vec::new();
        let org = Uuid::new_v4();

        let reply = CollabServer::handle_request(
            ClientRequest::Subscribe {
                org_id: org,
                target_id: None,
            },
            server.service(),
            &mut subscription,
            &mut opened,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::Subscribed { .. })));
        assert!(subscription.is_some());

        let reply = CollabServer::handle_request(
            ClientRequest::OpenSession {
                org_id: org,
                target_id: None,
                actor_id: Uuid::new_v4(),
                action: crate::session::ActionKind::Viewing,
            },
            server.service(),
            &mut subscription,
            &mut opened,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::SessionOpened { .. })));
        assert_eq!(opened.len(), 1);
    }
}
