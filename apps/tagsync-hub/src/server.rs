//! # Hub Server
//!
//! Serves a [`MemoryStore`] over the tagsync wire protocol.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          HubServer (Axum)                               │
//! │                                                                         │
//! │  / endpoint ──▶ WebSocket upgrade                                      │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │            ┌──────────────────┐                                         │
//! │            │  HubConnection   │ ◀── one per socket, owns a             │
//! │            │                  │     MemorySession                       │
//! │            └────────┬─────────┘                                         │
//! │                     │ completions and child events                      │
//! │                     ▼  (memory store worker thread)                     │
//! │            unbounded mpsc ──▶ writer task ──▶ socket                    │
//! │                                                                         │
//! │  Message Flow:                                                          │
//! │  ─────────────                                                          │
//! │  Get / Set / Authenticate   ──▶ Ack | Value | Failed (same request_id)  │
//! │  Subscribe                  ──▶ Child (added) per existing tag, then    │
//! │                                 Child on every change, or Cancelled     │
//! │  Unsubscribe                ──▶ (no reply)                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tagsync::protocol::{ChildKind, StoreMessage};
use tagsync::store::{ChildEvent, ChildListener, Completion};
use tagsync::{JwtTokenVerifier, MemorySession, MemoryStore, RemoteStore, Subscription};
use tagsync_core::NamespacePath;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;

// =============================================================================
// Constants
// =============================================================================

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Endpoint label for paths handed to the memory store, which keys on nodes.
const SESSION_ENDPOINT: &str = "hub://local/";

/// Hub server errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Per-socket Connection
// =============================================================================

/// Protocol state of one client socket.
pub struct HubConnection {
    session: MemorySession,
    subscriptions: HashMap<Uuid, Subscription>,
    out: mpsc::UnboundedSender<StoreMessage>,
}

impl HubConnection {
    pub fn new(session: MemorySession, out: mpsc::UnboundedSender<StoreMessage>) -> Self {
        HubConnection {
            session,
            subscriptions: HashMap::new(),
            out,
        }
    }

    /// Applies one client message. Replies are sent through the outgoing
    /// channel, possibly from the store's worker thread.
    pub fn handle_message(&mut self, msg: StoreMessage) {
        debug!(msg_type = %msg.type_name(), "Handling message");
        match msg {
            StoreMessage::Authenticate {
                request_id,
                path,
                token,
            } => {
                self.session
                    .authenticate(&session_path(path), &token, self.ack(request_id));
            }
            StoreMessage::Subscribe {
                subscription_id,
                path,
            } => {
                if let Some(previous) = self.subscriptions.remove(&subscription_id) {
                    self.session.unsubscribe(previous);
                }
                let listener = self.forward(subscription_id);
                let subscription = self.session.subscribe(&session_path(path), listener);
                self.subscriptions.insert(subscription_id, subscription);
            }
            StoreMessage::Unsubscribe { subscription_id } => {
                if let Some(subscription) = self.subscriptions.remove(&subscription_id) {
                    self.session.unsubscribe(subscription);
                }
            }
            StoreMessage::Get {
                request_id,
                path,
                tag,
            } => {
                let out = self.out.clone();
                let done: Completion<Option<String>> = Box::new(move |result| {
                    let reply = match result {
                        Ok(value) => StoreMessage::Value { request_id, value },
                        Err(e) => StoreMessage::Failed {
                            request_id,
                            message: e.to_string(),
                        },
                    };
                    let _ = out.send(reply);
                });
                self.session.get_once(&session_path(path), &tag, done);
            }
            StoreMessage::Set {
                request_id,
                path,
                tag,
                value,
            } => {
                self.session
                    .set(&session_path(path), &tag, value, self.ack(request_id));
            }
            other => {
                warn!(msg_type = %other.type_name(), "Unexpected message from client");
                self.send(StoreMessage::error(
                    "UNEXPECTED_MESSAGE",
                    &format!("{} is not a client message", other.type_name()),
                ));
            }
        }
    }

    /// Releases every subscription held by this socket.
    pub fn close(&mut self) {
        self.subscriptions.clear();
        self.session.close();
    }

    fn send(&self, msg: StoreMessage) {
        let _ = self.out.send(msg);
    }

    fn ack(&self, request_id: u64) -> Completion<()> {
        let out = self.out.clone();
        Box::new(move |result| {
            let reply = match result {
                Ok(()) => StoreMessage::Ack { request_id },
                Err(e) => StoreMessage::Failed {
                    request_id,
                    message: e.to_string(),
                },
            };
            let _ = out.send(reply);
        })
    }

    fn forward(&self, subscription_id: Uuid) -> ChildListener {
        let out = self.out.clone();
        Arc::new(move |event| {
            let msg = match event {
                ChildEvent::Added { tag, value } => StoreMessage::Child {
                    subscription_id,
                    kind: ChildKind::Added,
                    tag,
                    value: Some(value),
                },
                ChildEvent::Changed { tag, value } => StoreMessage::Child {
                    subscription_id,
                    kind: ChildKind::Changed,
                    tag,
                    value: Some(value),
                },
                ChildEvent::Removed { tag } => StoreMessage::Child {
                    subscription_id,
                    kind: ChildKind::Removed,
                    tag,
                    value: None,
                },
                ChildEvent::Cancelled { message } => StoreMessage::Cancelled {
                    subscription_id,
                    message,
                },
            };
            let _ = out.send(msg);
        })
    }
}

fn session_path(node: String) -> NamespacePath {
    NamespacePath::from_parts(SESSION_ENDPOINT, node)
}

// =============================================================================
// Server
// =============================================================================

struct HubState {
    store: MemoryStore,
}

/// The hub server.
pub struct HubServer {
    config: HubConfig,
    store: MemoryStore,
}

/// Handle for controlling a running hub.
pub struct HubHandle {
    local_addr: SocketAddr,
    store: MemoryStore,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Address the hub is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should use as their endpoint.
    pub fn endpoint(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// The store being served.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Shuts down the hub server.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| HubError::ChannelError("Hub shutdown channel closed".into()))
    }
}

impl HubServer {
    /// Creates a hub serving `store`.
    pub fn new(config: HubConfig, store: MemoryStore) -> Self {
        HubServer { config, store }
    }

    /// Creates a hub with a fresh store, protected when a secret is set.
    pub fn from_config(config: HubConfig) -> Self {
        let store = match &config.jwt_secret {
            Some(secret) => MemoryStore::with_verifier(Arc::new(JwtTokenVerifier::new(secret.clone()))),
            None => MemoryStore::new(),
        };
        Self::new(config, store)
    }

    /// Starts the hub server and returns a handle.
    pub async fn start(self) -> Result<HubHandle, HubError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let state = Arc::new(HubState {
            store: self.store.clone(),
        });

        // Build the router
        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        // Bind the listener
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| HubError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        info!(
            addr = %local_addr,
            protected = self.config.jwt_secret.is_some(),
            "Hub server started"
        );

        // Spawn the server
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Hub server shutting down");
            })
            .await
            .ok();
        });

        Ok(HubHandle {
            local_addr,
            store: self.store,
            shutdown_tx,
        })
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!(addr = %addr, "New WebSocket connection");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handles a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<HubState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<StoreMessage>();
    let mut connection = HubConnection::new(state.store.session(), out_tx);

    // Outgoing messages and keepalive
    let writer = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        ping_interval.tick().await;
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg.to_json() {
                        Ok(json) => {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(?e, "Failed to serialize message"),
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Main receive loop
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match StoreMessage::from_json(text.as_str()) {
                Ok(msg) => connection.handle_message(msg),
                Err(e) => {
                    warn!(addr = %addr, ?e, "Failed to parse message");
                    connection.send(StoreMessage::error("INVALID_MESSAGE", &e.to_string()));
                }
            },
            Ok(Message::Close(_)) => {
                debug!(addr = %addr, "Client sent close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(addr = %addr, ?e, "WebSocket error");
                break;
            }
        }
    }

    connection.close();
    writer.abort();
    info!(addr = %addr, "Connection closed");
}
