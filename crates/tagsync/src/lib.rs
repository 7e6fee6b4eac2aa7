//! # tagsync: Real-Time Synchronized Key-Value Client
//!
//! Stores, retrieves and observes tagged values in a remote hierarchical
//! store, scoped to a namespace derived from three configurable segments.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Client Architecture                            │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncClient (public API, Clone)                   │  │
//! │  │                                                                  │  │
//! │  │  Setters, StoreValue / GetValue / InitializeValue                │  │
//! │  │  Every call becomes a Command on the dispatch queue              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │            ClientDispatcher (single ordered context)             │  │
//! │  │                                                                  │  │
//! │  │  Reconfigure state machine, epochs, deferred operations          │  │
//! │  └───────┬──────────────────────┬───────────────────────┬───────────┘  │
//! │          ▼                      ▼                       ▼               │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
//! │  │ AuthCoordinator│  │ ListenerLifecycle  │  │  SyncEventEmitter  │    │
//! │  │                │  │                    │  │                    │    │
//! │  │ Token issuing  │  │ One subscription,  │  │ value retrieved    │    │
//! │  │ and sign-in    │  │ torn down before   │  │ data changed       │    │
//! │  │ per path       │  │ the next one       │  │ error              │    │
//! │  └────────────────┘  └────────────────────┘  └────────────────────┘    │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  RemoteStore (trait)                             │  │
//! │  │   WsRemoteStore: hub over WebSocket, reconnect + backoff         │  │
//! │  │   MemoryStore:   in-process tree with its own worker thread      │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`auth`] - Credentials, token issuing and verification
//! - [`client`] - `SyncClient`, its builder and dispatcher
//! - [`config`] - TOML client configuration with env overrides
//! - [`dispatch`] - Commands, remote events and epochs
//! - [`emitter`] - Event sink toward the application
//! - [`error`] - Client error types
//! - [`lifecycle`] - Subscription ownership
//! - [`protocol`] - Hub wire messages
//! - [`store`] - Remote store abstraction and backends
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use tagsync::{ChannelEmitter, ClientConfig, SyncClientBuilder, Value};
//!
//! # async fn run() -> tagsync::SyncResult<()> {
//! let (emitter, mut events) = ChannelEmitter::new();
//! let client = SyncClientBuilder::new(ClientConfig::load_or_default(None))
//!     .with_emitter(Arc::new(emitter))
//!     .spawn()?;
//!
//! client.set_developer_bucket("alice/");
//! client.set_project_bucket("proj1");
//! client.store_value("score", &Value::Integer(10))?;
//! client.get_value("score", &Value::Integer(0))?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod emitter;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod store;

// Re-exports for convenience
pub use auth::{
    AuthState, Credential, JwtTokenIssuer, JwtTokenVerifier, NamespaceClaims, TokenIssuer,
    TokenVerifier,
};
pub use client::{ClientDispatcher, ClientStatus, SyncClient, SyncClientBuilder};
pub use config::ClientConfig;
pub use emitter::{ChannelEmitter, ClientEvent, NoOpEmitter, SyncEventEmitter};
pub use error::{SyncError, SyncResult};
pub use store::memory::{MemorySession, MemoryStore};
pub use store::ws::{TransportConfig, WsRemoteStore};
pub use store::{ChildEvent, RemoteStore, RemoteStoreHandle, Subscription};
pub use tagsync_core::{Namespace, NamespacePath, Value, ValueCodec};
