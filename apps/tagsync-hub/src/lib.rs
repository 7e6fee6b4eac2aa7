//! # tagsync-hub
//!
//! Reference remote store for tagsync clients: the in-process
//! [`tagsync::MemoryStore`] served over WebSocket.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncClient ─► WsRemoteStore ══ ws://host:8765/ ══► HubServer          │
//! │                                                       │                 │
//! │                                                       ▼                 │
//! │                                          MemoryStore (+ JWT verifier)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod server;

pub use config::{ConfigError, HubConfig, DEFAULT_HUB_PORT};
pub use server::{HubConnection, HubError, HubHandle, HubServer};
