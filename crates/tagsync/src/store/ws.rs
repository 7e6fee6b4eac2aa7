//! # WebSocket Store
//!
//! [`RemoteStore`] backed by a tagsync hub over WebSocket, with automatic
//! reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 One Connection Task per Endpoint                        │
//! │                                                                         │
//! │  ┌────────────┐   connect()   ┌────────────┐                           │
//! │  │  Backoff   │ ────────────► │ Connecting │ ── failure ──┐            │
//! │  └────────────┘               └─────┬──────┘              │            │
//! │        ▲                            │ success             ▼            │
//! │        │                            ▼               fail queued        │
//! │        │                   ┌──────────────────┐   requests, keep       │
//! │        │                   │ replay sessions  │   subscriptions        │
//! │        │                   │ replay subscribe │                        │
//! │        │                   └────────┬─────────┘                        │
//! │        │                            ▼                                  │
//! │        │                   ┌──────────────────┐                        │
//! │        └── disconnect ──── │    Connected     │                        │
//! │          (in-flight        └──────────────────┘                        │
//! │           requests fail)                                               │
//! │                                                                         │
//! │  BACKOFF STRATEGY (Exponential with Jitter)                            │
//! │  ───────────────────────────────────────────                           │
//! │  Attempt 1: 500ms                                                       │
//! │  Attempt 2: 1s                                                          │
//! │  ...                                                                    │
//! │  Max: 60s                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are never retried. Subscriptions and authenticated sessions are
//! replayed after a reconnect; child events repeating a value the listener
//! already has are suppressed.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tagsync_core::NamespacePath;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{RemoteOperation, SyncError, SyncResult};
use crate::protocol::{ChildKind, StoreMessage};
use crate::store::{ChildEvent, ChildListener, Completion, RemoteStore, Subscription};

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Checks that `endpoint` is a ws:// or wss:// URL.
pub fn parse_endpoint(endpoint: &str) -> SyncResult<Url> {
    let url = Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SyncError::InvalidUrl(format!(
            "endpoint must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

// =============================================================================
// Commands to a Connection Task
// =============================================================================

enum Request {
    Get { node: String, tag: String },
    Set { node: String, tag: String, value: Option<String> },
    Authenticate { node: String, token: String },
}

impl Request {
    fn into_message(self, request_id: u64) -> StoreMessage {
        match self {
            Request::Get { node, tag } => StoreMessage::Get {
                request_id,
                path: node,
                tag,
            },
            Request::Set { node, tag, value } => StoreMessage::Set {
                request_id,
                path: node,
                tag,
                value,
            },
            Request::Authenticate { node, token } => StoreMessage::Authenticate {
                request_id,
                path: node,
                token,
            },
        }
    }
}

/// Continuation of an in-flight request.
enum Reply {
    Get(Completion<Option<String>>),
    Set(Completion<()>),
    Auth {
        node: String,
        token: String,
        done: Completion<()>,
    },
    /// Session replayed after a reconnect; nobody is waiting.
    Replay { node: String },
}

impl Reply {
    fn fail(self, err: SyncError) {
        match self {
            Reply::Get(done) => done(Err(err)),
            Reply::Set(done) | Reply::Auth { done, .. } => done(Err(err)),
            Reply::Replay { node } => warn!(node = %node, error = %err, "Session replay failed"),
        }
    }
}

enum Outgoing {
    Subscribe {
        subscription: Subscription,
        node: String,
        listener: ChildListener,
    },
    Unsubscribe(Subscription),
    Request { request: Request, reply: Reply },
}

impl Outgoing {
    fn fail_or_keep(self, conn: &mut Connection, err: &SyncError) {
        match self {
            Outgoing::Subscribe {
                subscription,
                node,
                listener,
            } => conn.track(subscription, node, listener),
            Outgoing::Unsubscribe(subscription) => {
                conn.subscriptions.remove(&subscription.id());
            }
            Outgoing::Request { reply, .. } => reply.fail(err.clone()),
        }
    }
}

// =============================================================================
// WebSocket Store
// =============================================================================

/// WebSocket [`RemoteStore`]. One connection task is started lazily per
/// endpoint on the runtime the store was created in.
pub struct WsRemoteStore {
    config: TransportConfig,
    runtime: Handle,
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<Outgoing>>>,
    routes: Mutex<HashMap<Subscription, String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WsRemoteStore {
    /// Creates the store. Must be called inside a Tokio runtime.
    pub fn new(config: TransportConfig) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            SyncError::InvalidConfig("WsRemoteStore requires a Tokio runtime".into())
        })?;
        Ok(WsRemoteStore {
            config,
            runtime,
            connections: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Queues `outgoing` on the endpoint's connection, starting one if
    /// needed. Returns the command back if the endpoint is malformed.
    fn send(&self, endpoint: &str, outgoing: Outgoing) -> Result<(), (Outgoing, SyncError)> {
        let url = match parse_endpoint(endpoint) {
            Ok(url) => url,
            Err(e) => return Err((outgoing, e)),
        };

        let mut connections = lock(&self.connections);
        let outgoing = match connections.get(endpoint) {
            Some(tx) => match tx.send(outgoing) {
                Ok(()) => return Ok(()),
                // Task gave up after max_retries; start a fresh one.
                Err(mpsc::error::SendError(outgoing)) => outgoing,
            },
            None => outgoing,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(url.to_string(), self.config.clone(), rx);
        self.runtime.spawn(connection.run());
        // Freshly created receiver cannot be closed yet.
        let _ = tx.send(outgoing);
        connections.insert(endpoint.to_string(), tx);
        Ok(())
    }

    /// Runs `f` on the runtime so callbacks never run on the caller's thread.
    fn deliver(&self, f: impl FnOnce() + Send + 'static) {
        self.runtime.spawn(async move { f() });
    }

    fn reject(&self, outgoing: Outgoing, err: SyncError) {
        warn!(error = %err, "Rejecting store operation");
        self.deliver(move || match outgoing {
            Outgoing::Subscribe { listener, .. } => listener(ChildEvent::Cancelled {
                message: err.to_string(),
            }),
            Outgoing::Request { reply, .. } => reply.fail(err),
            Outgoing::Unsubscribe(_) => {}
        });
    }

    fn request(&self, path: &NamespacePath, request: Request, reply: Reply) {
        if let Err((outgoing, err)) = self.send(path.endpoint(), Outgoing::Request { request, reply })
        {
            self.reject(outgoing, err);
        }
    }
}

impl RemoteStore for WsRemoteStore {
    fn subscribe(&self, path: &NamespacePath, listener: ChildListener) -> Subscription {
        let subscription = Subscription::new();
        let outgoing = Outgoing::Subscribe {
            subscription,
            node: path.node().to_string(),
            listener,
        };
        match self.send(path.endpoint(), outgoing) {
            Ok(()) => {
                lock(&self.routes).insert(subscription, path.endpoint().to_string());
            }
            Err((outgoing, err)) => self.reject(outgoing, err),
        }
        subscription
    }

    fn unsubscribe(&self, subscription: Subscription) {
        let Some(endpoint) = lock(&self.routes).remove(&subscription) else {
            return;
        };
        if let Some(tx) = lock(&self.connections).get(&endpoint) {
            let _ = tx.send(Outgoing::Unsubscribe(subscription));
        }
    }

    fn get_once(&self, path: &NamespacePath, tag: &str, done: Completion<Option<String>>) {
        let request = Request::Get {
            node: path.node().to_string(),
            tag: tag.to_string(),
        };
        self.request(path, request, Reply::Get(done));
    }

    fn set(&self, path: &NamespacePath, tag: &str, value: Option<String>, done: Completion<()>) {
        let request = Request::Set {
            node: path.node().to_string(),
            tag: tag.to_string(),
            value,
        };
        self.request(path, request, Reply::Set(done));
    }

    fn authenticate(&self, path: &NamespacePath, token: &str, done: Completion<()>) {
        let node = path.node().to_string();
        let request = Request::Authenticate {
            node: node.clone(),
            token: token.to_string(),
        };
        let reply = Reply::Auth {
            node,
            token: token.to_string(),
            done,
        };
        self.request(path, request, reply);
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct TrackedSubscription {
    node: String,
    listener: ChildListener,
    /// Last value delivered per tag, to suppress replays.
    known: HashMap<String, String>,
}

enum LoopExit {
    /// Every store handle is gone.
    Closed,
    /// The socket dropped; reconnect.
    Lost,
}

struct Connection {
    url: String,
    config: TransportConfig,
    rx: mpsc::UnboundedReceiver<Outgoing>,
    subscriptions: HashMap<Uuid, TrackedSubscription>,
    /// node → token, replayed after a reconnect.
    sessions: HashMap<String, String>,
    pending: HashMap<u64, Reply>,
    next_request: u64,
}

impl Connection {
    fn new(url: String, config: TransportConfig, rx: mpsc::UnboundedReceiver<Outgoing>) -> Self {
        Connection {
            url,
            config,
            rx,
            subscriptions: HashMap::new(),
            sessions: HashMap::new(),
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    /// Main connection loop.
    async fn run(mut self) {
        info!(url = %self.url, "Store connection starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;

        loop {
            match Self::connect_with_timeout(&self.url, self.config.connect_timeout).await {
                Ok(ws_stream) => {
                    info!(url = %self.url, "WebSocket connected");
                    backoff.reset();
                    retry_count = 0;

                    let exit = self.connection_loop(ws_stream).await;
                    self.fail_pending(SyncError::Disconnected);
                    match exit {
                        Ok(LoopExit::Closed) => break,
                        Ok(LoopExit::Lost) => warn!(url = %self.url, "Connection lost"),
                        Err(e) => warn!(url = %self.url, error = %e, "Connection loop ended"),
                    }
                }
                Err(e) => {
                    error!(url = %self.url, error = %e, "Failed to connect");
                    if !self.fail_queued(&e) {
                        break;
                    }
                }
            }

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            match backoff.next_backoff() {
                Some(duration) => {
                    debug!(?duration, attempt = retry_count, "Waiting before reconnect");
                    tokio::time::sleep(duration).await;
                }
                None => {
                    error!("Backoff exhausted");
                    break;
                }
            }
        }

        self.rx.close();
        let closed = SyncError::ConnectionFailed(format!("connection to {} closed", self.url));
        self.fail_queued(&closed);
        for (_, sub) in self.subscriptions.drain() {
            (sub.listener)(ChildEvent::Cancelled {
                message: closed.to_string(),
            });
        }
        info!(url = %self.url, "Store connection stopped");
    }

    /// Connects with timeout.
    ///
    /// Borrows only the URL so the `run` future stays `Send`. Pending
    /// completions are not `Sync`, so `&Connection` must not cross an await.
    async fn connect_with_timeout(
        url: &str,
        connect_timeout: Duration,
    ) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        match timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(connect_timeout.as_secs())),
        }
    }

    async fn connection_loop(
        &mut self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> SyncResult<LoopExit> {
        let (mut write, mut read) = ws_stream.split();

        for msg in self.replay() {
            debug!(msg_type = %msg.type_name(), "Replaying");
            write.send(WsMessage::Text(msg.to_json()?.into())).await?;
        }

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                outgoing = self.rx.recv() => match outgoing {
                    Some(outgoing) => {
                        if let Some(msg) = self.prepare(outgoing) {
                            debug!(msg_type = %msg.type_name(), "Sending message");
                            write.send(WsMessage::Text(msg.to_json()?.into())).await?;
                        }
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(LoopExit::Closed);
                    }
                },

                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match StoreMessage::from_json(&text) {
                        Ok(msg) => {
                            debug!(msg_type = %msg.type_name(), "Received message");
                            self.handle_incoming(msg);
                        }
                        Err(e) => warn!(error = %e, "Failed to parse message"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(LoopExit::Lost);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SyncError::from(e)),
                    None => return Ok(LoopExit::Lost),
                },

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(Vec::new().into())).await?;
                    debug!("Sent ping");
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Sessions first, then subscriptions.
    fn replay(&mut self) -> Vec<StoreMessage> {
        let sessions: Vec<(String, String)> = self
            .sessions
            .iter()
            .map(|(n, t)| (n.clone(), t.clone()))
            .collect();

        let mut messages = Vec::new();
        for (node, token) in sessions {
            let id = self.next_id();
            self.pending.insert(id, Reply::Replay { node: node.clone() });
            messages.push(Request::Authenticate { node, token }.into_message(id));
        }
        for (id, sub) in &self.subscriptions {
            messages.push(StoreMessage::Subscribe {
                subscription_id: *id,
                path: sub.node.clone(),
            });
        }
        messages
    }

    fn track(&mut self, subscription: Subscription, node: String, listener: ChildListener) {
        self.subscriptions.insert(
            subscription.id(),
            TrackedSubscription {
                node,
                listener,
                known: HashMap::new(),
            },
        );
    }

    /// Turns a command into the message to write, registering state first.
    fn prepare(&mut self, outgoing: Outgoing) -> Option<StoreMessage> {
        match outgoing {
            Outgoing::Subscribe {
                subscription,
                node,
                listener,
            } => {
                let msg = StoreMessage::Subscribe {
                    subscription_id: subscription.id(),
                    path: node.clone(),
                };
                self.track(subscription, node, listener);
                Some(msg)
            }
            Outgoing::Unsubscribe(subscription) => self
                .subscriptions
                .remove(&subscription.id())
                .map(|_| StoreMessage::Unsubscribe {
                    subscription_id: subscription.id(),
                }),
            Outgoing::Request { request, reply } => {
                let id = self.next_id();
                self.pending.insert(id, reply);
                Some(request.into_message(id))
            }
        }
    }

    /// Fails requests queued while disconnected. Returns false once every
    /// store handle is gone.
    fn fail_queued(&mut self, err: &SyncError) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(outgoing) => outgoing.fail_or_keep(self, err),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn fail_pending(&mut self, err: SyncError) {
        for (_, reply) in self.pending.drain() {
            reply.fail(err.clone());
        }
    }

    fn handle_incoming(&mut self, msg: StoreMessage) {
        match msg {
            StoreMessage::Ack { request_id } => match self.pending.remove(&request_id) {
                Some(Reply::Set(done)) => done(Ok(())),
                Some(Reply::Auth { node, token, done }) => {
                    self.sessions.insert(node, token);
                    done(Ok(()));
                }
                Some(Reply::Replay { node }) => debug!(node = %node, "Session restored"),
                Some(Reply::Get(done)) => {
                    done(Err(SyncError::InvalidMessage("Ack for a Get".into())))
                }
                None => debug!(request_id, "Ack for unknown request"),
            },
            StoreMessage::Value { request_id, value } => match self.pending.remove(&request_id) {
                Some(Reply::Get(done)) => done(Ok(value)),
                Some(other) => other.fail(SyncError::InvalidMessage("Value for a write".into())),
                None => debug!(request_id, "Value for unknown request"),
            },
            StoreMessage::Failed {
                request_id,
                message,
            } => match self.pending.remove(&request_id) {
                Some(Reply::Get(done)) => done(Err(SyncError::remote(RemoteOperation::Get, message))),
                Some(Reply::Set(done)) => done(Err(SyncError::remote(RemoteOperation::Set, message))),
                Some(Reply::Auth { done, .. }) => done(Err(SyncError::AuthFailed(message))),
                Some(Reply::Replay { node }) => {
                    warn!(node = %node, %message, "Replayed session rejected");
                    self.sessions.remove(&node);
                }
                None => debug!(request_id, "Failure for unknown request"),
            },
            StoreMessage::Child {
                subscription_id,
                kind,
                tag,
                value,
            } => self.deliver_child(subscription_id, kind, tag, value),
            StoreMessage::Cancelled {
                subscription_id,
                message,
            } => {
                if let Some(sub) = self.subscriptions.remove(&subscription_id) {
                    (sub.listener)(ChildEvent::Cancelled { message });
                }
            }
            StoreMessage::Error { code, message } => {
                warn!(%code, %message, "Hub reported an error");
            }
            other => warn!(msg_type = %other.type_name(), "Unexpected message from hub"),
        }
    }

    fn deliver_child(&mut self, id: Uuid, kind: ChildKind, tag: String, value: Option<String>) {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            debug!(%id, "Child event for released subscription");
            return;
        };

        let event = match (kind, value) {
            (ChildKind::Removed, _) => {
                sub.known.remove(&tag);
                ChildEvent::Removed { tag }
            }
            (kind, Some(value)) => {
                if sub.known.get(&tag) == Some(&value) {
                    return;
                }
                sub.known.insert(tag.clone(), value.clone());
                if kind == ChildKind::Added {
                    ChildEvent::Added { tag, value }
                } else {
                    ChildEvent::Changed { tag, value }
                }
            }
            (_, None) => {
                warn!(tag = %tag, "Child event without a value");
                return;
            }
        };
        (sub.listener)(event);
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }
}
