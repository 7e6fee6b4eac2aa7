//! # Remote Store
//!
//! The seam between the client and whatever backend holds the data.
//!
//! ## Primitives
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RemoteStore (trait)                              │
//! │                                                                         │
//! │  subscribe(path, listener)  ──► Subscription                           │
//! │  unsubscribe(subscription)                                              │
//! │  get_once(path, tag, done)      done(Ok(Some(text)) | Ok(None) | Err)  │
//! │  set(path, tag, value, done)    value None removes the tag             │
//! │  authenticate(path, token, done)                                       │
//! │                                                                         │
//! │  Every callback runs on a backend-owned thread. Nothing here blocks.   │
//! │                                                                         │
//! │  Backends:                                                             │
//! │  • memory::MemoryStore  in-process tree, one delivery worker thread    │
//! │  • ws::WsRemoteStore    WebSocket client for tagsync-hub               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`RemoteStoreHandle`] binds a store to one [`NamespacePath`]. The client
//! rebuilds it whenever the path changes.

pub mod memory;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use tagsync_core::NamespacePath;
use uuid::Uuid;

use crate::error::SyncResult;

/// One-shot continuation for an asynchronous remote operation.
pub type Completion<T> = Box<dyn FnOnce(SyncResult<T>) + Send + 'static>;

/// Receiver of child events for one subscription.
pub type ChildListener = Arc<dyn Fn(ChildEvent) + Send + Sync + 'static>;

/// A change below a subscribed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// A tag appeared (also sent for every existing tag on subscribe).
    Added { tag: String, value: String },
    /// A tag's value changed.
    Changed { tag: String, value: String },
    /// A tag was removed.
    Removed { tag: String },
    /// The backend ended the subscription.
    Cancelled { message: String },
}

/// Handle for a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(Uuid);

impl Subscription {
    /// Allocates a fresh subscription id.
    pub fn new() -> Self {
        Subscription(Uuid::new_v4())
    }

    /// The id.
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five primitives a backend must offer.
///
/// Implementations deliver every callback from their own worker thread or
/// task, and must deliver callbacks for one subscription in the order the
/// changes happened.
pub trait RemoteStore: Send + Sync {
    /// Starts child notifications for `path`.
    ///
    /// Failures are reported to the listener as [`ChildEvent::Cancelled`].
    fn subscribe(&self, path: &NamespacePath, listener: ChildListener) -> Subscription;

    /// Stops a subscription. Unknown subscriptions are ignored.
    fn unsubscribe(&self, subscription: Subscription);

    /// Reads one tag once. `Ok(None)` means no value is present.
    fn get_once(&self, path: &NamespacePath, tag: &str, done: Completion<Option<String>>);

    /// Writes one tag. `None` removes it.
    fn set(&self, path: &NamespacePath, tag: &str, value: Option<String>, done: Completion<()>);

    /// Authenticates this store session for `path`.
    fn authenticate(&self, path: &NamespacePath, token: &str, done: Completion<()>);
}

// =============================================================================
// Path-bound Handle
// =============================================================================

/// A [`RemoteStore`] bound to one namespace path.
#[derive(Clone)]
pub struct RemoteStoreHandle {
    store: Arc<dyn RemoteStore>,
    path: NamespacePath,
}

impl RemoteStoreHandle {
    /// Binds `store` to `path`.
    pub fn new(store: Arc<dyn RemoteStore>, path: NamespacePath) -> Self {
        RemoteStoreHandle { store, path }
    }

    /// The path this handle targets.
    pub fn path(&self) -> &NamespacePath {
        &self.path
    }

    pub fn subscribe_children(&self, listener: ChildListener) -> Subscription {
        self.store.subscribe(&self.path, listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.store.unsubscribe(subscription)
    }

    pub fn get_once(&self, tag: &str, done: Completion<Option<String>>) {
        self.store.get_once(&self.path, tag, done)
    }

    pub fn set(&self, tag: &str, value: Option<String>, done: Completion<()>) {
        self.store.set(&self.path, tag, value, done)
    }

    /// Authenticates for this handle's path only. A rebuilt handle for a
    /// different path starts unauthenticated.
    pub fn authenticate(&self, token: &str, done: Completion<()>) {
        self.store.authenticate(&self.path, token, done)
    }
}

impl fmt::Debug for RemoteStoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStoreHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
