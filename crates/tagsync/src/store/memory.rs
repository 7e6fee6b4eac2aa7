//! # In-process Store
//!
//! A hierarchical store held in memory, used by tests and by tagsync-hub.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          MemoryStore                                    │
//! │                                                                         │
//! │  caller thread(s)                     delivery worker thread            │
//! │  ─────────────────                    ──────────────────────            │
//! │  set("score", "10")                                                     │
//! │    lock tree                                                            │
//! │    mutate                                                               │
//! │    enqueue callbacks ───── mpsc ────► run callbacks in queue order      │
//! │    unlock                                                               │
//! │                                                                         │
//! │  Enqueueing under the tree lock means the worker sees mutations in     │
//! │  exactly the order they were applied, whichever thread applied them.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nodes are keyed by node path; the endpoint of a [`NamespacePath`] is
//! ignored, so one `MemoryStore` answers for every endpoint.
//!
//! A [`MemorySession`] is one client's view: it carries the session's
//! authentication. With a verifier installed, nodes under `developers/` can
//! only be read, written or subscribed by a session authenticated for them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use tagsync_core::{NamespacePath, SHARED_MODE_SEGMENT};
use tracing::{debug, warn};

use crate::auth::TokenVerifier;
use crate::error::{SyncError, SyncResult};
use crate::store::{ChildEvent, ChildListener, Completion, RemoteStore, Subscription};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, BTreeMap<String, String>>,
    subscribers: HashMap<Subscription, (String, ChildListener)>,
}

struct Shared {
    tree: Mutex<Tree>,
    jobs: mpsc::Sender<Job>,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

/// Shared in-memory store. Cloning shares the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an unprotected store: any non-empty token authenticates.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a store whose `developers/` subtree is guarded by `verifier`.
    pub fn with_verifier(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self::build(Some(verifier))
    }

    fn build(verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        let (jobs, rx) = mpsc::channel::<Job>();
        let spawned = std::thread::Builder::new()
            .name("tagsync-memory-store".into())
            .spawn(move || {
                // Ends when the last store clone drops its sender.
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn delivery worker; callbacks will not run");
        }

        MemoryStore {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::default()),
                jobs,
                verifier,
            }),
        }
    }

    /// Opens a new unauthenticated session on this store.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: self.clone(),
            authorized: Arc::new(Mutex::new(HashSet::new())),
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reads a tag directly, bypassing sessions and the worker.
    pub fn peek(&self, node: &str, tag: &str) -> Option<String> {
        self.tree()
            .nodes
            .get(node)
            .and_then(|children| children.get(tag).cloned())
    }

    /// Number of live subscriptions on `node`.
    pub fn subscriber_count(&self, node: &str) -> usize {
        self.tree()
            .subscribers
            .values()
            .filter(|(n, _)| n == node)
            .count()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        // A panicking listener never holds this lock, so poisoning only
        // means a test assertion failed mid-call.
        self.shared
            .tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn post(&self, job: Job) {
        if self.shared.jobs.send(job).is_err() {
            warn!("Delivery worker gone; dropping callback");
        }
    }

    fn is_protected(&self, node: &str) -> bool {
        self.shared.verifier.is_some() && node.starts_with(SHARED_MODE_SEGMENT)
    }

    fn write(&self, node: &str, tag: &str, value: Option<String>) {
        let mut tree = self.tree();
        let children = tree.nodes.entry(node.to_string()).or_default();
        let event = match value {
            Some(value) => match children.insert(tag.to_string(), value.clone()) {
                Some(old) if old == value => None,
                Some(_) => Some(ChildEvent::Changed {
                    tag: tag.to_string(),
                    value,
                }),
                None => Some(ChildEvent::Added {
                    tag: tag.to_string(),
                    value,
                }),
            },
            None => children
                .remove(tag)
                .map(|_| ChildEvent::Removed { tag: tag.to_string() }),
        };
        if children.is_empty() {
            tree.nodes.remove(node);
        }

        let Some(event) = event else { return };
        debug!(node, tag, "Child changed");
        for (sub_node, listener) in tree.subscribers.values() {
            if sub_node == node {
                let listener = listener.clone();
                let event = event.clone();
                self.post(Box::new(move || listener(event)));
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// One client's connection to a [`MemoryStore`].
#[derive(Clone)]
pub struct MemorySession {
    store: MemoryStore,
    authorized: Arc<Mutex<HashSet<String>>>,
    owned: Arc<Mutex<HashSet<Subscription>>>,
}

impl MemorySession {
    /// Ends every subscription opened through this session.
    pub fn close(&self) {
        let owned: Vec<Subscription> = lock(&self.owned).drain().collect();
        let mut tree = self.store.tree();
        for sub in owned {
            tree.subscribers.remove(&sub);
        }
    }

    fn check_access(&self, node: &str) -> SyncResult<()> {
        if self.store.is_protected(node) && !lock(&self.authorized).contains(node) {
            return Err(SyncError::PermissionDenied(node.to_string()));
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RemoteStore for MemorySession {
    fn subscribe(&self, path: &NamespacePath, listener: ChildListener) -> Subscription {
        let subscription = Subscription::new();
        let node = path.node().to_string();

        if let Err(e) = self.check_access(&node) {
            let message = e.to_string();
            self.store
                .post(Box::new(move || listener(ChildEvent::Cancelled { message })));
            return subscription;
        }

        let mut tree = self.store.tree();
        if let Some(children) = tree.nodes.get(&node) {
            for (tag, value) in children {
                let listener = listener.clone();
                let event = ChildEvent::Added {
                    tag: tag.clone(),
                    value: value.clone(),
                };
                self.store.post(Box::new(move || listener(event)));
            }
        }
        tree.subscribers.insert(subscription, (node, listener));
        lock(&self.owned).insert(subscription);
        subscription
    }

    fn unsubscribe(&self, subscription: Subscription) {
        lock(&self.owned).remove(&subscription);
        self.store.tree().subscribers.remove(&subscription);
    }

    fn get_once(&self, path: &NamespacePath, tag: &str, done: Completion<Option<String>>) {
        let result = self
            .check_access(path.node())
            .map(|_| self.store.peek(path.node(), tag));
        self.store.post(Box::new(move || done(result)));
    }

    fn set(&self, path: &NamespacePath, tag: &str, value: Option<String>, done: Completion<()>) {
        let result = self.check_access(path.node());
        if result.is_ok() {
            self.store.write(path.node(), tag, value);
        }
        self.store.post(Box::new(move || done(result)));
    }

    fn authenticate(&self, path: &NamespacePath, token: &str, done: Completion<()>) {
        let result = if token.is_empty() {
            Err(SyncError::AuthFailed("empty token".into()))
        } else {
            match &self.store.shared.verifier {
                Some(verifier) => verifier.verify(token, path),
                None => Ok(()),
            }
        };
        if result.is_ok() {
            lock(&self.authorized).insert(path.node().to_string());
        } else {
            lock(&self.authorized).remove(path.node());
        }
        self.store.post(Box::new(move || done(result)));
    }
}
