//! # Sync Client
//!
//! Public API and the dispatcher that owns all client state.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncClient                                     │
//! │                                                                         │
//! │  SyncClient (Clone, any thread)          ClientDispatcher (one task)   │
//! │  ──────────────────────────────          ───────────────────────────   │
//! │  set_endpoint / set_*_bucket   ──┐                                      │
//! │  set_credential                  │  Command    ┌──────────────────┐     │
//! │  store_value (encodes here)      ├───────────► │ ClientState      │     │
//! │  get_value / initialize_value  ──┘             │  namespace       │     │
//! │                                                │  credential      │     │
//! │  endpoint() ... status()  ◄── shared props ─── │  AuthCoordinator │     │
//! │                                                │  ListenerLifecyc.│     │
//! │  RemoteStore threads ──── RemoteEvent ───────► │  deferred ops    │     │
//! │                                                └────────┬─────────┘     │
//! │                                                         ▼               │
//! │                                               SyncEventEmitter          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconfigure
//! ```text
//!   setter ──► reconfigure()
//!                │ in flight?  ──yes──► mark dirty, return
//!                │ unchanged and subscribed? ──yes──► return
//!                ▼
//!              teardown old subscription
//!              epoch += 1, rebuild handle for the new path
//!                ▼
//!              auth.begin() ── IssueToken ──► issuer ──► TokenIssued ─┐
//!                │          ── Authenticate ─► store ──► AuthCompleted┤
//!                │ NotRequired / AlreadyAuthenticated / Missing       │
//!                ▼                                                    │
//!              finish ◄───────────────────────────────────────────────┘
//!                │ dirty? ──yes──► reconfigure() again
//!                ▼
//!              subscribe(path, epoch), run deferred operations
//! ```
//!
//! Operations issued while a reconfiguration is in flight are deferred in
//! call order. Subscription and auth completions from an older epoch are
//! dropped. Get and set completions are dropped only once the path they ran
//! on is no longer the current path.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tagsync_core::{Namespace, NamespacePath, Value, ValueCodec};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthCoordinator, AuthState, AuthStep, Credential, TokenIssuer};
use crate::config::ClientConfig;
use crate::dispatch::{
    Binding, Command, DispatchSender, Envelope, Epoch, PendingRequest, RemoteEvent,
};
use crate::emitter::{NoOpEmitter, SyncEventEmitter};
use crate::error::{RemoteOperation, SyncError, SyncResult};
use crate::lifecycle::{ListenerLifecycle, Notification};
use crate::store::ws::WsRemoteStore;
use crate::store::{RemoteStore, RemoteStoreHandle};

// =============================================================================
// Status
// =============================================================================

/// Snapshot of the client's configuration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Path the client currently targets.
    pub path: NamespacePath,
    /// Authentication state for that path.
    pub auth_state: AuthState,
    /// True when a live subscription delivers notifications.
    pub subscribed: bool,
    /// True while a reconfiguration waits on issuing or authentication.
    pub reconfiguring: bool,
    /// Current configuration generation.
    pub epoch: Epoch,
}

struct Properties {
    namespace: Namespace,
    credential: String,
}

struct Shared {
    props: RwLock<Properties>,
    status: RwLock<ClientStatus>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle to a synchronized key-value client.
///
/// ## Usage
/// ```rust,ignore
/// let (emitter, mut events) = ChannelEmitter::new();
/// let client = SyncClientBuilder::new(ClientConfig::default())
///     .with_emitter(Arc::new(emitter))
///     .spawn()?;
///
/// client.set_developer_bucket("alice/");
/// client.set_project_bucket("proj1");
/// client.store_value("score", &Value::from(10))?;
/// client.get_value("score", &Value::from(0))?;
///
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
#[derive(Clone)]
pub struct SyncClient {
    sender: DispatchSender,
    shared: Arc<Shared>,
}

impl SyncClient {
    // =========================================================================
    // Property Setters
    // =========================================================================

    /// Sets the store endpoint and reconfigures.
    pub fn set_endpoint(&self, url: impl Into<String>) {
        let url = url.into();
        write(&self.shared.props).namespace.endpoint = url.clone();
        self.sender.command(Command::SetEndpoint(url));
    }

    /// Sets the developer bucket and reconfigures.
    pub fn set_developer_bucket(&self, bucket: impl Into<String>) {
        let bucket = bucket.into();
        write(&self.shared.props).namespace.developer_bucket = bucket.clone();
        self.sender.command(Command::SetDeveloperBucket(bucket));
    }

    /// Sets the project bucket and reconfigures.
    pub fn set_project_bucket(&self, bucket: impl Into<String>) {
        let bucket = bucket.into();
        write(&self.shared.props).namespace.project_bucket = bucket.clone();
        self.sender.command(Command::SetProjectBucket(bucket));
    }

    /// Sets the credential and reconfigures. An empty token lets the client
    /// mint one when an issuer is configured.
    pub fn set_credential(&self, token: impl Into<String>) {
        let token = token.into();
        write(&self.shared.props).credential = token.clone();
        self.sender.command(Command::SetCredential(token));
    }

    /// Re-checks the configuration; rebuilds only if something changed or
    /// the subscription was lost.
    pub fn reconfigure(&self) {
        self.sender.command(Command::Reconfigure);
    }

    // =========================================================================
    // Property Getters
    // =========================================================================

    pub fn endpoint(&self) -> String {
        read(&self.shared.props).namespace.endpoint.clone()
    }

    pub fn developer_bucket(&self) -> String {
        read(&self.shared.props).namespace.developer_bucket.clone()
    }

    pub fn project_bucket(&self) -> String {
        read(&self.shared.props).namespace.project_bucket.clone()
    }

    /// The credential last set, or the one minted for the current path.
    pub fn credential(&self) -> String {
        read(&self.shared.props).credential.clone()
    }

    pub fn status(&self) -> ClientStatus {
        read(&self.shared.status).clone()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Stores `value` under `tag`. [`Value::Absent`] removes the tag.
    ///
    /// Encoding failures are returned here; remote failures arrive as an
    /// error event.
    pub fn store_value(&self, tag: &str, value: &Value) -> SyncResult<()> {
        let wire = encode_optional(value)?;
        self.send(Command::Store {
            tag: tag.to_string(),
            wire,
        })
    }

    /// Requests the value at `tag`. The result arrives as a "value
    /// retrieved" event carrying either the stored value or `default`.
    pub fn get_value(&self, tag: &str, default: &Value) -> SyncResult<()> {
        let default_wire = ValueCodec::encode(default)?;
        self.send(Command::Get {
            tag: tag.to_string(),
            default_wire,
        })
    }

    /// Stores `value` at `tag` only if nothing is there yet; otherwise
    /// reports the existing value as retrieved.
    ///
    /// This is a read followed by a write, not a transaction. Two clients
    /// initializing the same empty tag can both write; the later write wins.
    pub fn initialize_value(&self, tag: &str, value: &Value) -> SyncResult<()> {
        let wire = encode_optional(value)?;
        self.send(Command::Initialize {
            tag: tag.to_string(),
            wire,
        })
    }

    /// Stops the dispatcher and releases the subscription.
    pub fn shutdown(&self) {
        self.sender.command(Command::Shutdown);
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        if self.sender.command(command) {
            Ok(())
        } else {
            Err(SyncError::ShuttingDown)
        }
    }
}

fn encode_optional(value: &Value) -> SyncResult<Option<String>> {
    if value.is_absent() {
        Ok(None)
    } else {
        Ok(Some(ValueCodec::encode(value)?))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncClient`]. Collaborators are passed in here, never
/// looked up globally.
pub struct SyncClientBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    issuer: Option<Arc<dyn TokenIssuer>>,
}

impl SyncClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        SyncClientBuilder {
            config,
            store: None,
            emitter: None,
            issuer: None,
        }
    }

    /// Uses `store` instead of a [`WsRemoteStore`].
    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Enables minting credentials when none is set.
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Builds the client and its dispatcher without starting anything.
    ///
    /// The WebSocket store (the default) needs a Tokio runtime.
    pub fn build(self) -> SyncResult<(SyncClient, ClientDispatcher)> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(WsRemoteStore::new(self.config.transport.transport_config())?),
        };
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let namespace = self.config.namespace.namespace();
        let token = self.config.namespace.credential.clone();
        let credential = if token.is_empty() {
            Credential::default()
        } else {
            Credential::user(token.clone())
        };

        let shared = Arc::new(Shared {
            props: RwLock::new(Properties {
                namespace: namespace.clone(),
                credential: token,
            }),
            status: RwLock::new(ClientStatus {
                path: namespace.path(),
                auth_state: AuthState::Unauthenticated,
                subscribed: false,
                reconfiguring: false,
                epoch: Epoch::default(),
            }),
        });

        let (sender, rx) = DispatchSender::channel();
        sender.command(Command::Reconfigure);

        let state = ClientState {
            store,
            emitter,
            issuer: self.issuer,
            sender: sender.clone(),
            shared: shared.clone(),
            namespace,
            credential,
            handle: None,
            lifecycle: ListenerLifecycle::new(),
            auth: AuthCoordinator::new(),
            epoch: Epoch::default(),
            reconfiguring: false,
            dirty: false,
            configured: None,
            deferred: VecDeque::new(),
            stopped: false,
        };

        Ok((SyncClient { sender, shared }, ClientDispatcher { state, rx }))
    }

    /// Builds the client and runs its dispatcher on the current runtime.
    pub fn spawn(self) -> SyncResult<SyncClient> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::InvalidConfig(format!("no Tokio runtime: {}", e)))?;
        let (client, dispatcher) = self.build()?;
        runtime.spawn(dispatcher.run());
        Ok(client)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The dispatch context: the only place client state is touched.
pub struct ClientDispatcher {
    state: ClientState,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ClientDispatcher {
    /// Processes envelopes until [`SyncClient::shutdown`].
    pub async fn run(mut self) {
        info!("Client dispatcher starting");
        while let Some(envelope) = self.rx.recv().await {
            if !self.state.handle(envelope) {
                break;
            }
        }
        info!("Client dispatcher stopped");
    }

    /// Processes everything already queued without waiting, for callers
    /// that drive the dispatch context from their own loop.
    ///
    /// Returns the number of envelopes handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while !self.state.stopped {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    handled += 1;
                    self.state.handle(envelope);
                }
                Err(_) => break,
            }
        }
        handled
    }
}

struct ClientState {
    store: Arc<dyn RemoteStore>,
    emitter: Arc<dyn SyncEventEmitter>,
    issuer: Option<Arc<dyn TokenIssuer>>,
    sender: DispatchSender,
    shared: Arc<Shared>,

    namespace: Namespace,
    credential: Credential,
    handle: Option<RemoteStoreHandle>,
    lifecycle: ListenerLifecycle,
    auth: AuthCoordinator,
    epoch: Epoch,

    /// Waiting on token issuing or authentication.
    reconfiguring: bool,
    /// A setter arrived while `reconfiguring`.
    dirty: bool,
    /// Path and token of the last completed reconfiguration.
    configured: Option<(NamespacePath, String)>,
    deferred: VecDeque<Command>,
    stopped: bool,
}

impl ClientState {
    /// Returns false once the dispatcher should stop.
    fn handle(&mut self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Command(command) => self.handle_command(command),
            Envelope::Remote(event) => self.handle_remote(event),
        }
        !self.stopped
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetEndpoint(url) => {
                self.namespace.endpoint = url;
                self.reconfigure();
            }
            Command::SetDeveloperBucket(bucket) => {
                self.namespace.developer_bucket = bucket;
                self.reconfigure();
            }
            Command::SetProjectBucket(bucket) => {
                self.namespace.project_bucket = bucket;
                self.reconfigure();
            }
            Command::SetCredential(token) => {
                self.credential = if token.is_empty() {
                    Credential::default()
                } else {
                    Credential::user(token)
                };
                self.reconfigure();
            }
            Command::Reconfigure => self.reconfigure(),
            Command::Shutdown => self.shutdown(),
            op @ (Command::Store { .. } | Command::Get { .. } | Command::Initialize { .. }) => {
                self.execute_or_defer(op)
            }
        }
    }

    fn execute_or_defer(&mut self, op: Command) {
        if self.reconfiguring || self.handle.is_none() {
            debug!("Deferring operation until reconfiguration completes");
            self.deferred.push_back(op);
        } else {
            self.execute(op);
        }
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    fn reconfigure(&mut self) {
        if self.reconfiguring {
            debug!("Reconfiguration in flight; coalescing");
            self.dirty = true;
            return;
        }

        let path = self.namespace.path();
        let credential = self.credential.for_path(&path);
        if credential != self.credential {
            debug!(path = %path, "Dropping credential minted for another path");
            self.credential = credential;
            write(&self.shared.props).credential.clear();
        }

        let unchanged = self
            .configured
            .as_ref()
            .is_some_and(|(p, t)| *p == path && t == self.credential.token());
        if unchanged
            && self.lifecycle.is_active_for(&path)
            && self.auth.state() != AuthState::AuthFailed
        {
            debug!(path = %path, "Configuration unchanged");
            return;
        }

        // Teardown before setup.
        if let Some(old) = &self.handle {
            self.lifecycle.teardown(old);
        }
        self.epoch = self.epoch.next();
        self.handle = Some(RemoteStoreHandle::new(self.store.clone(), path.clone()));
        self.configured = None;
        self.reconfiguring = true;
        info!(path = %path, epoch = %self.epoch, "Reconfiguring");

        self.advance_auth();
        self.update_status();
    }

    fn advance_auth(&mut self) {
        let step = self
            .auth
            .begin(&self.namespace, &self.credential, self.issuer.is_some());
        let epoch = self.epoch;
        let sender = self.sender.clone();

        match step {
            AuthStep::NotRequired | AuthStep::AlreadyAuthenticated => self.finish_reconfigure(),
            AuthStep::IssueToken { developer, project } => {
                let Some(issuer) = self.issuer.clone() else {
                    self.finish_reconfigure();
                    return;
                };
                debug!(developer = %developer, project = %project, "Requesting credential");
                let path = self.namespace.path();
                issuer.issue_token(
                    &developer,
                    &project,
                    Box::new(move |result| {
                        sender.post(RemoteEvent::TokenIssued { epoch, path, result })
                    }),
                );
            }
            AuthStep::Authenticate(token) => {
                let Some(handle) = self.handle.clone() else {
                    self.finish_reconfigure();
                    return;
                };
                debug!(path = %handle.path(), "Authenticating");
                let path = handle.path().clone();
                let sent = token.clone();
                handle.authenticate(
                    &sent,
                    Box::new(move |result| {
                        sender.post(RemoteEvent::AuthCompleted { epoch, path, token, result })
                    }),
                );
            }
            AuthStep::MissingCredential => {
                let path = self.namespace.path();
                self.report(SyncError::MissingCredential(path.to_string()));
                self.finish_reconfigure();
            }
        }
    }

    fn finish_reconfigure(&mut self) {
        self.reconfiguring = false;

        if self.dirty {
            self.dirty = false;
            self.reconfigure();
            return;
        }

        let Some(handle) = self.handle.clone() else {
            return;
        };
        self.lifecycle
            .subscribe(&handle, self.epoch, self.sender.clone());
        self.configured = Some((handle.path().clone(), self.credential.token().to_string()));
        self.update_status();

        while !self.reconfiguring {
            let Some(op) = self.deferred.pop_front() else {
                break;
            };
            self.execute(op);
        }
    }

    fn shutdown(&mut self) {
        if let Some(handle) = &self.handle {
            self.lifecycle.teardown(handle);
        }
        self.deferred.clear();
        self.stopped = true;
        self.update_status();
        info!("Client shut down");
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn execute(&mut self, op: Command) {
        let Some(handle) = self.handle.clone() else {
            self.deferred.push_back(op);
            return;
        };
        let path = handle.path().clone();
        let sender = self.sender.clone();

        match op {
            Command::Store { tag, wire } => {
                debug!(tag = %tag, "Storing value");
                let key = tag.clone();
                handle.set(
                    &key,
                    wire,
                    Box::new(move |result| sender.post(RemoteEvent::SetCompleted { path, tag, result })),
                );
            }
            Command::Get { tag, default_wire } => {
                debug!(tag = %tag, "Getting value");
                let key = tag.clone();
                let request = PendingRequest::Get { tag, default_wire };
                handle.get_once(
                    &key,
                    Box::new(move |result| {
                        sender.post(RemoteEvent::GetCompleted { path, request, result })
                    }),
                );
            }
            Command::Initialize { tag, wire } => {
                debug!(tag = %tag, "Initializing value");
                let key = tag.clone();
                let request = PendingRequest::Initialize { tag, wire };
                handle.get_once(
                    &key,
                    Box::new(move |result| {
                        sender.post(RemoteEvent::GetCompleted { path, request, result })
                    }),
                );
            }
            other => warn!(?other, "Not an operation"),
        }
    }

    // =========================================================================
    // Remote Events
    // =========================================================================

    fn handle_remote(&mut self, event: RemoteEvent) {
        if let Err(stale) = self.check_current(event.binding()) {
            debug!(error = %stale, "Dropping completion");
            return;
        }

        match event {
            RemoteEvent::Child { epoch, event } => match self.lifecycle.accept(epoch, event) {
                Some(Notification::ValueChanged { tag, wire }) => {
                    match ValueCodec::decode_optional(wire.as_deref()) {
                        Ok(value) => self.emitter.emit_data_changed(&tag, &value),
                        Err(e) => self.report(e.into()),
                    }
                }
                Some(Notification::Cancelled { message }) => {
                    self.update_status();
                    self.report(SyncError::remote(RemoteOperation::Subscribe, message));
                }
                None => {}
            },
            RemoteEvent::GetCompleted { request, result, .. } => {
                self.complete_get(request, result)
            }
            RemoteEvent::SetCompleted { tag, result, .. } => match result {
                Ok(()) => debug!(tag = %tag, "Value stored"),
                Err(e) => self.report(e),
            },
            RemoteEvent::TokenIssued { path, result, .. } => match result {
                Ok(token) => {
                    if self.credential.is_empty() && path == self.namespace.path() {
                        info!(path = %path, "Credential issued");
                        write(&self.shared.props).credential = token.clone();
                        self.credential = Credential::issued(token, path);
                    } else {
                        debug!(path = %path, "Discarding credential for a superseded path");
                    }
                    if self.dirty {
                        // Rebuild for the latest setters; mints again if needed.
                        self.finish_reconfigure();
                    } else {
                        self.advance_auth();
                    }
                }
                Err(e) => {
                    self.auth.fail();
                    self.report(e);
                    self.finish_reconfigure();
                }
            },
            RemoteEvent::AuthCompleted {
                path, token, result, ..
            } => {
                match result {
                    Ok(()) => self.auth.complete(&path, &token),
                    Err(e) => {
                        // Best effort: continue unauthenticated.
                        self.auth.fail();
                        self.report(e);
                    }
                }
                self.finish_reconfigure();
            }
        }
    }

    /// Checks that an event still belongs to the current configuration.
    fn check_current(&self, binding: Binding<'_>) -> SyncResult<()> {
        match binding {
            Binding::Epoch(epoch) if epoch != self.epoch => Err(SyncError::StaleResult {
                stamp: format!("epoch {}", epoch),
                current: format!("epoch {}", self.epoch),
            }),
            Binding::Path(path) if *path != self.namespace.path() => Err(SyncError::StaleResult {
                stamp: path.to_string(),
                current: self.namespace.path().to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn complete_get(&mut self, request: PendingRequest, result: SyncResult<Option<String>>) {
        let existing = match result {
            Ok(existing) => existing,
            Err(e) => {
                self.report(e);
                return;
            }
        };

        match (request, existing) {
            (PendingRequest::Get { tag, .. }, Some(wire))
            | (PendingRequest::Initialize { tag, .. }, Some(wire)) => self.retrieved(&tag, &wire),
            (PendingRequest::Get { tag, default_wire }, None) => self.retrieved(&tag, &default_wire),
            (PendingRequest::Initialize { tag, wire }, None) => {
                debug!(tag = %tag, "Tag absent; initializing");
                self.execute_or_defer(Command::Store { tag, wire });
            }
        }
    }

    fn retrieved(&self, tag: &str, wire: &str) {
        match ValueCodec::decode(wire) {
            Ok(value) => self.emitter.emit_value_retrieved(tag, &value),
            Err(e) => self.report(e.into()),
        }
    }

    fn report(&self, err: SyncError) {
        if err.is_stale() {
            debug!(error = %err, "Dropping stale result");
            return;
        }
        error!(error = %err, "Store operation failed");
        self.emitter.emit_error(&err.to_string());
    }

    fn update_status(&self) {
        let mut status = write(&self.shared.status);
        *status = ClientStatus {
            path: self.namespace.path(),
            auth_state: self.auth.state(),
            subscribed: self.lifecycle.active().is_some(),
            reconfiguring: self.reconfiguring,
            epoch: self.epoch,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtTokenIssuer;
    use crate::emitter::{ChannelEmitter, ClientEvent};
    use crate::store::{ChildEvent, ChildListener, Completion, Subscription};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tagsync_core::DEFAULT_ENDPOINT;

    /// A store whose completions are fired by hand.
    #[derive(Default)]
    struct ScriptedStore {
        inner: Mutex<Scripted>,
    }

    #[derive(Default)]
    struct Scripted {
        listeners: HashMap<Subscription, (String, ChildListener)>,
        subscribed: Vec<String>,
        gets: VecDeque<(String, Completion<Option<String>>)>,
        sets: Vec<(String, Option<String>)>,
        auths: VecDeque<(String, String, Completion<()>)>,
    }

    impl ScriptedStore {
        fn listener(&self, node: &str) -> ChildListener {
            let inner = self.inner.lock().unwrap();
            inner
                .listeners
                .values()
                .find(|(n, _)| n == node)
                .map(|(_, l)| l.clone())
                .expect("no listener for node")
        }

        fn live(&self) -> usize {
            self.inner.lock().unwrap().listeners.len()
        }

        fn subscribed(&self) -> Vec<String> {
            self.inner.lock().unwrap().subscribed.clone()
        }

        fn sets(&self) -> Vec<(String, Option<String>)> {
            self.inner.lock().unwrap().sets.clone()
        }

        fn answer_get(&self, value: Option<&str>) {
            let (_, done) = self.inner.lock().unwrap().gets.pop_front().expect("no get");
            done(Ok(value.map(str::to_string)));
        }

        fn pending_auths(&self) -> usize {
            self.inner.lock().unwrap().auths.len()
        }

        fn answer_auth(&self, result: SyncResult<()>) -> (String, String) {
            let (node, token, done) = self.inner.lock().unwrap().auths.pop_front().expect("no auth");
            done(result);
            (node, token)
        }
    }

    impl RemoteStore for ScriptedStore {
        fn subscribe(&self, path: &NamespacePath, listener: ChildListener) -> Subscription {
            let sub = Subscription::new();
            let mut inner = self.inner.lock().unwrap();
            inner.subscribed.push(path.node().to_string());
            inner.listeners.insert(sub, (path.node().to_string(), listener));
            sub
        }

        fn unsubscribe(&self, subscription: Subscription) {
            self.inner.lock().unwrap().listeners.remove(&subscription);
        }

        fn get_once(&self, path: &NamespacePath, tag: &str, done: Completion<Option<String>>) {
            let _ = path;
            self.inner.lock().unwrap().gets.push_back((tag.to_string(), done));
        }

        fn set(&self, _path: &NamespacePath, tag: &str, value: Option<String>, done: Completion<()>) {
            self.inner.lock().unwrap().sets.push((tag.to_string(), value));
            done(Ok(()));
        }

        fn authenticate(&self, path: &NamespacePath, token: &str, done: Completion<()>) {
            self.inner
                .lock()
                .unwrap()
                .auths
                .push_back((path.node().to_string(), token.to_string(), done));
        }
    }

    /// An issuer whose tokens are handed out by hand.
    #[derive(Default)]
    struct ManualIssuer {
        requests: Mutex<VecDeque<(String, String, Completion<String>)>>,
        issued: Mutex<Vec<(String, String)>>,
    }

    impl ManualIssuer {
        fn issued(&self) -> Vec<(String, String)> {
            self.issued.lock().unwrap().clone()
        }

        fn answer(&self, token: &str) {
            let (_, _, done) = self.requests.lock().unwrap().pop_front().expect("no request");
            done(Ok(token.to_string()));
        }
    }

    impl TokenIssuer for ManualIssuer {
        fn issue_token(&self, developer: &str, project: &str, done: Completion<String>) {
            self.issued
                .lock()
                .unwrap()
                .push((developer.to_string(), project.to_string()));
            self.requests
                .lock()
                .unwrap()
                .push_back((developer.to_string(), project.to_string(), done));
        }
    }

    struct Harness {
        client: SyncClient,
        dispatcher: ClientDispatcher,
        store: Arc<ScriptedStore>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl Harness {
        fn new(config: ClientConfig, issuer: Option<Arc<dyn TokenIssuer>>) -> Self {
            let store = Arc::new(ScriptedStore::default());
            let (emitter, events) = ChannelEmitter::new();
            let mut builder = SyncClientBuilder::new(config)
                .with_store(store.clone())
                .with_emitter(Arc::new(emitter));
            if let Some(issuer) = issuer {
                builder = builder.with_token_issuer(issuer);
            }
            let (client, mut dispatcher) = builder.build().unwrap();
            dispatcher.drain();
            Harness {
                client,
                dispatcher,
                store,
                events,
            }
        }

        fn custom(project: &str) -> Self {
            let mut config = ClientConfig::default();
            config.namespace.endpoint = "mem://test/".into();
            config.namespace.project_bucket = project.into();
            Self::new(config, None)
        }

        fn events(&mut self) -> Vec<ClientEvent> {
            self.dispatcher.drain();
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }
    }

    fn changed(tag: &str, n: i64) -> ClientEvent {
        ClientEvent::DataChanged {
            tag: tag.into(),
            value: Value::Integer(n),
        }
    }

    #[test]
    fn test_teardown_before_setup() {
        let mut h = Harness::custom("p1");
        let old = h.store.listener("p1");

        h.client.set_project_bucket("p2");
        h.dispatcher.drain();
        assert_eq!(h.store.live(), 1);

        // Late notification from the released P1 subscription.
        old(ChildEvent::Added { tag: "x".into(), value: "1".into() });
        assert!(h.events().is_empty());

        h.store.listener("p2")(ChildEvent::Changed { tag: "x".into(), value: "2".into() });
        assert_eq!(h.events(), vec![changed("x", 2)]);
    }

    #[test]
    fn test_reconfigure_is_idempotent() {
        let mut h = Harness::custom("p1");
        h.client.reconfigure();
        h.client.reconfigure();
        h.client.set_project_bucket("p1");
        h.dispatcher.drain();

        assert_eq!(h.store.live(), 1);
        assert_eq!(h.store.subscribed(), vec!["p1".to_string()]);
        assert!(h.client.status().subscribed);
    }

    #[test]
    fn test_ordering_under_interleaved_threads() {
        let mut h = Harness::custom("p1");
        let listener = h.store.listener("p1");

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let listener = listener.clone();
                std::thread::spawn(move || {
                    for n in 1..=50 {
                        listener(ChildEvent::Changed {
                            tag: format!("x{}", t),
                            value: n.to_string(),
                        });
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut seen: HashMap<String, Vec<i64>> = HashMap::new();
        for event in h.events() {
            if let ClientEvent::DataChanged { tag, value } = event {
                seen.entry(tag).or_default().push(value.as_i64().unwrap());
            }
        }
        assert_eq!(seen.len(), 4);
        for values in seen.values() {
            assert_eq!(*values, (1..=50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_removal_is_change_to_absent() {
        let mut h = Harness::custom("p1");
        h.store.listener("p1")(ChildEvent::Removed { tag: "gone".into() });
        assert_eq!(
            h.events(),
            vec![ClientEvent::DataChanged { tag: "gone".into(), value: Value::Absent }]
        );
    }

    #[test]
    fn test_get_value_default_not_written() {
        let mut h = Harness::custom("p1");
        h.client.get_value("missing-tag", &Value::from(42)).unwrap();
        h.dispatcher.drain();
        h.store.answer_get(None);

        assert_eq!(
            h.events(),
            vec![ClientEvent::ValueRetrieved { tag: "missing-tag".into(), value: Value::Integer(42) }]
        );
        assert!(h.store.sets().is_empty());
    }

    #[test]
    fn test_initialize_value_race_last_write_wins() {
        let mut h = Harness::custom("p1");
        h.client.initialize_value("t", &Value::from("A")).unwrap();
        h.client.initialize_value("t", &Value::from("B")).unwrap();
        h.dispatcher.drain();

        // Both reads observe absence before either write lands.
        h.store.answer_get(None);
        h.store.answer_get(None);
        h.dispatcher.drain();

        assert_eq!(
            h.store.sets(),
            vec![
                ("t".to_string(), Some("\"A\"".to_string())),
                ("t".to_string(), Some("\"B\"".to_string())),
            ]
        );
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_initialize_value_present_is_retrieved() {
        let mut h = Harness::custom("p1");
        h.client.initialize_value("t", &Value::from(1)).unwrap();
        h.dispatcher.drain();
        h.store.answer_get(Some("7"));

        assert_eq!(
            h.events(),
            vec![ClientEvent::ValueRetrieved { tag: "t".into(), value: Value::Integer(7) }]
        );
        assert!(h.store.sets().is_empty());
    }

    #[test]
    fn test_stale_get_dropped() {
        let mut h = Harness::custom("p1");
        h.client.get_value("t", &Value::from(0)).unwrap();
        h.dispatcher.drain();

        h.client.set_project_bucket("p2");
        h.dispatcher.drain();
        h.store.answer_get(Some("5"));

        assert!(h.events().is_empty());
    }

    #[test]
    fn test_same_path_rebuild_keeps_pending_get() {
        let mut h = Harness::custom("p1");
        h.client.get_value("t", &Value::from(0)).unwrap();
        h.dispatcher.drain();

        // New credential, same path: the rebuild must not orphan the get.
        h.client.set_credential("tok");
        h.dispatcher.drain();
        assert!(h.client.status().reconfiguring);
        h.store.answer_get(Some("5"));

        assert_eq!(
            h.events(),
            vec![ClientEvent::ValueRetrieved { tag: "t".into(), value: Value::Integer(5) }]
        );
    }

    #[test]
    fn test_encoding_error_is_synchronous() {
        let h = Harness::custom("p1");
        let err = h.client.store_value("t", &Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
    }

    #[test]
    fn test_absent_store_removes() {
        let mut h = Harness::custom("p1");
        h.client.store_value("t", &Value::Absent).unwrap();
        h.dispatcher.drain();
        assert_eq!(h.store.sets(), vec![("t".to_string(), None)]);
    }

    #[test]
    fn test_auth_failure_is_best_effort() {
        let mut config = ClientConfig::default();
        config.namespace.developer_bucket = "alice/".into();
        config.namespace.project_bucket = "proj1".into();
        config.namespace.credential = "bad".into();
        let mut h = Harness::new(config, None);

        // Operations wait for the reconfiguration.
        h.client.store_value("score", &Value::from(10)).unwrap();
        h.dispatcher.drain();
        assert!(h.client.status().reconfiguring);
        assert!(h.store.sets().is_empty());

        let (node, token) = h
            .store
            .answer_auth(Err(SyncError::AuthFailed("rejected".into())));
        assert_eq!(node, "developers/alice/proj1");
        assert_eq!(token, "bad");

        let events = h.events();
        assert!(matches!(&events[..], [ClientEvent::Error { message }] if message.contains("rejected")));
        assert_eq!(h.client.status().auth_state, AuthState::AuthFailed);
        assert_eq!(h.store.live(), 1);
        assert_eq!(h.store.sets(), vec![("score".to_string(), Some("10".to_string()))]);
    }

    #[test]
    fn test_setters_coalesce_while_authenticating() {
        let mut config = ClientConfig::default();
        config.namespace.project_bucket = "p1".into();
        config.namespace.credential = "tok".into();
        let mut h = Harness::new(config, None);

        h.client.set_project_bucket("p2");
        h.client.set_project_bucket("p3");
        h.dispatcher.drain();

        let (node, _) = h.store.answer_auth(Ok(()));
        assert_eq!(node, "developers/p1");
        h.dispatcher.drain();

        // One rebuild for the final path; P1 was never subscribed.
        let (node, _) = h.store.answer_auth(Ok(()));
        assert_eq!(node, "developers/p3");
        h.dispatcher.drain();

        assert_eq!(h.store.subscribed(), vec!["developers/p3".to_string()]);
        assert_eq!(h.client.status().auth_state, AuthState::Authenticated);
    }

    #[test]
    fn test_auth_not_carried_to_new_path() {
        let mut config = ClientConfig::default();
        config.namespace.project_bucket = "p1".into();
        config.namespace.credential = "tok".into();
        let mut h = Harness::new(config, None);

        h.client.set_project_bucket("p3");
        h.dispatcher.drain();
        let (node, _) = h.store.answer_auth(Ok(()));
        assert_eq!(node, "developers/p1");
        h.dispatcher.drain();

        assert_eq!(h.store.pending_auths(), 1);
        assert!(h.store.subscribed().is_empty());
        assert_eq!(h.client.status().auth_state, AuthState::Authenticating);

        let (node, token) = h.store.answer_auth(Ok(()));
        assert_eq!((node.as_str(), token.as_str()), ("developers/p3", "tok"));
        h.dispatcher.drain();
        assert_eq!(h.store.subscribed(), vec!["developers/p3".to_string()]);
    }

    #[test]
    fn test_token_minted_for_superseded_path_is_reissued() {
        let mut config = ClientConfig::default();
        config.namespace.developer_bucket = "alice/".into();
        config.namespace.project_bucket = "proj1".into();
        let issuer = Arc::new(ManualIssuer::default());
        let shared: Arc<dyn TokenIssuer> = issuer.clone();
        let mut h = Harness::new(config, Some(shared));

        h.client.set_project_bucket("proj2");
        h.dispatcher.drain();
        issuer.answer("token-for-alice/proj1");
        h.dispatcher.drain();

        assert_eq!(
            issuer.issued(),
            vec![
                ("alice/".to_string(), "proj1".to_string()),
                ("alice/".to_string(), "proj2".to_string()),
            ]
        );
        assert_eq!(h.store.pending_auths(), 0);
        assert!(h.store.subscribed().is_empty());
        assert_eq!(h.client.credential(), "");

        issuer.answer("token-for-alice/proj2");
        h.dispatcher.drain();
        let (node, token) = h.store.answer_auth(Ok(()));
        assert_eq!(node, "developers/alice/proj2");
        assert_eq!(token, "token-for-alice/proj2");
        h.dispatcher.drain();

        assert_eq!(h.store.subscribed(), vec!["developers/alice/proj2".to_string()]);
        assert_eq!(h.client.credential(), "token-for-alice/proj2");
        assert_eq!(h.client.status().auth_state, AuthState::Authenticated);
    }

    #[test]
    fn test_issued_credential_follows_path() {
        let mut config = ClientConfig::default();
        config.namespace.developer_bucket = "alice/".into();
        config.namespace.project_bucket = "proj1".into();
        let issuer: Arc<dyn TokenIssuer> = Arc::new(JwtTokenIssuer::new("k", 60));
        let mut h = Harness::new(config, Some(issuer));

        let (_, first) = h.store.answer_auth(Ok(()));
        h.dispatcher.drain();
        assert_eq!(h.client.credential(), first);

        h.client.set_project_bucket("proj2");
        h.dispatcher.drain();
        let (node, second) = h.store.answer_auth(Ok(()));
        assert_eq!(node, "developers/alice/proj2");
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_credential_reported() {
        let mut config = ClientConfig::default();
        config.namespace.endpoint = DEFAULT_ENDPOINT.into();
        let mut h = Harness::new(config, None);
        let events = h.events();
        assert!(matches!(&events[..], [ClientEvent::Error { .. }]));
        assert_eq!(h.store.live(), 1);
    }

    #[test]
    fn test_shutdown_releases_subscription() {
        let mut h = Harness::custom("p1");
        h.client.shutdown();
        h.dispatcher.drain();
        assert_eq!(h.store.live(), 0);
    }
}
