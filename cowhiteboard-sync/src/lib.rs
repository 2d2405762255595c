//! # cowhiteboard-sync: Real-time sync client for shared whiteboards
//!
//! Keeps a local record store in step with a room on the relay server over
//! WebSocket, and reports connection status and presence to the UI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   local edits   ┌──────────────┐    JSON frames    ┌─────────┐
//! │ DocumentStore│ ──────────────► │  Publisher   │ ────────────────► │         │
//! │ (records)    │                 └──────────────┘                   │  Relay  │
//! │              │  remote merges  ┌──────────────┐    JSON frames    │ /ws/:id │
//! │              │ ◄────────────── │InboundHandler│ ◄──────────────── │         │
//! └──────────────┘                 └──────┬───────┘                   └─────────┘
//!                                         │ EchoGate
//!                                  ┌──────┴───────┐
//!                                  │  Supervisor  │ ── status ──► UI
//!                                  │ (reconnect)  │
//!                                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and change sets
//! - [`store`]: Record store contract plus an in-memory implementation
//! - [`gate`]: Echo suppression while remote changes are applied
//! - [`transport`]: WebSocket connections and the live-connection slot
//! - [`supervisor`]: Reconnect state machine and status reporting
//! - [`inbound`]: Applies relay frames to the store
//! - [`publisher`]: Sends local edits to the relay
//! - [`client`]: Ties it all together per mounted board
//! - [`config`]: Client configuration and environment overrides

pub mod protocol;
pub mod store;
pub mod gate;
pub mod transport;
pub mod supervisor;
pub mod inbound;
pub mod publisher;
pub mod client;
pub mod config;

// Re-exports for convenience
pub use protocol::{
    ChangeSet, ClientMessage, ProtocolError, Record, RecordId, RecordMap, RoomId,
    ServerMessage,
};
pub use store::{
    ChangeScope, ChangeSource, DocumentStore, ListenFilter, ListenerId, MemoryStore,
    StoreError, StoreEvent,
};
pub use gate::{EchoGate, Origin};
pub use transport::{Connection, Connector, LiveConnection, WsConnection, WsConnector};
pub use supervisor::{Backoff, ConnectionStatus, FixedDelay, DEFAULT_RECONNECT_DELAY};
pub use inbound::{ApplyOutcome, Inbound, InboundHandler};
pub use publisher::Publisher;
pub use client::{ClientError, SyncClient, SyncEvent, EVENT_CAPACITY};
pub use config::{ClientConfig, ConfigError, DEFAULT_SERVER_URL};
