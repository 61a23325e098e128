//! # attest-collab — Multi-user collaboration for Attest compliance records
//!
//! Lets several operators view and edit the same requirement record
//! concurrently: presence tracking, optimistic concurrency control with
//! whole-record conflict resolution, and an ordered activity feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per UI)     │    Binary Proto     │ (gateway)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                      ┌──────▼───────┐
//!                                      │ CollabService│
//!                                      └──────┬───────┘
//!                ┌────────────────┬───────────┼───────────────┐
//!                ▼                ▼           ▼               ▼
//!        ┌──────────────┐ ┌─────────────┐ ┌────────────┐ ┌──────────┐
//!        │ SessionReg.  │ │ RecordStore │ │ Conflict   │ │ Activity │
//!        │ (presence)   │ │ (CAS write) │ │ Resolver   │ │ Feed+Bus │
//!        └──────────────┘ └─────────────┘ └────────────┘ └──────────┘
//! ```
//!
//! The store's compare-and-swap is the only synchronization point: a write
//! either commits against the exact version the writer saw, or comes back as
//! a typed `Conflict` carrying the current record for resolution
//! (`keep_local`, `keep_remote`, or a caller-reconciled `merge`). Accepted
//! writes and presence transitions fan out per organization in commit order.
//!
//! ## Modules
//!
//! - [`record`] — requirement records, field values, validation
//! - [`store`] — CAS record store (in-memory and RocksDB) + durable event log
//! - [`session`] — presence sessions with heartbeat liveness
//! - [`conflict`] — conflict capture and the resolution state machine
//! - [`bus`] — per-organization change fan-out and subscriptions
//! - [`feed`] — ordered, append-only activity feed
//! - [`service`] — the coordinator the UI layer consumes
//! - [`protocol`] — binary wire protocol (bincode)
//! - [`server`] — WebSocket gateway
//! - [`client`] — UI-side client

pub mod record;
pub mod store;
pub mod session;
pub mod conflict;
pub mod bus;
pub mod feed;
pub mod service;
pub mod protocol;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use record::{
    fields, ComplianceStatus, FieldUpdates, FieldValue, Requirement, RiskLevel,
    ValidationError, validate_updates,
};
pub use store::{MemoryStore, RecordStore, RocksStore, StoreConfig, StoreError, WriteOutcome};
pub use session::{ActionKind, Session, SessionRegistry};
pub use conflict::{
    ConflictKind, ConflictPhase, ConflictRecord, ConflictResolver, Resolution, ResolutionKind,
};
pub use bus::{BusManager, BusStats, ChangeBus, ChangeEvent, Subscription};
pub use feed::{ActivityEvent, ActivityFeed, ChangeKind};
pub use service::{
    CollabConfig, CollabError, CollabService, ResolveOutcome, ServiceStats, UpdateOutcome,
};
pub use protocol::{ClientRequest, ErrorKind, ProtocolError, ServerMessage};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{CollabClient, CollabEvent, ConnectionState};
