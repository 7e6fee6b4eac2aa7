//! # Dispatch Context
//!
//! The single ordered queue every client input passes through.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncClient (any thread) ── Command ──┐                                │
//! │                                       ▼                                │
//! │                            ┌─────────────────────┐                     │
//! │  store worker threads ──►  │  unbounded mpsc     │ ──► ClientDispatcher│
//! │  (RemoteEvent + epoch)     │  (FIFO, one reader) │     (sole owner of  │
//! │                            └─────────────────────┘      client state)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote callbacks never touch client state. They only post a
//! [`RemoteEvent`] carrying its [`Binding`]. Subscription and authentication
//! events are bound to the [`Epoch`] of the rebuild that started them. Gets
//! and sets are bound to the namespace path they ran on, so rebuilding the
//! same path (a new credential, a retried authentication) keeps them alive.
//! The dispatcher drops events whose binding is no longer current.

use std::fmt;

use tokio::sync::mpsc;
use tracing::warn;

use tagsync_core::NamespacePath;

use crate::error::SyncResult;
use crate::store::ChildEvent;

/// Generation counter of the client configuration. Bumped on every rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests from the public API, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetEndpoint(String),
    SetDeveloperBucket(String),
    SetProjectBucket(String),
    SetCredential(String),
    /// Write encoded `wire` at `tag`. `None` removes the tag.
    Store { tag: String, wire: Option<String> },
    /// Read `tag`, falling back to the encoded default.
    Get { tag: String, default_wire: String },
    /// Read `tag`; write `wire` if absent.
    Initialize { tag: String, wire: Option<String> },
    /// Rebuild against the current configuration if it changed.
    Reconfigure,
    Shutdown,
}

/// A get awaiting its single result.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRequest {
    Get { tag: String, default_wire: String },
    Initialize { tag: String, wire: Option<String> },
}

/// Completions and notifications posted from store threads.
#[derive(Debug)]
pub enum RemoteEvent {
    Child {
        epoch: Epoch,
        event: ChildEvent,
    },
    GetCompleted {
        path: NamespacePath,
        request: PendingRequest,
        result: SyncResult<Option<String>>,
    },
    SetCompleted {
        path: NamespacePath,
        tag: String,
        result: SyncResult<()>,
    },
    /// A credential minted for `path`.
    TokenIssued {
        epoch: Epoch,
        path: NamespacePath,
        result: SyncResult<String>,
    },
    /// Outcome of presenting `token` on `path`.
    AuthCompleted {
        epoch: Epoch,
        path: NamespacePath,
        token: String,
        result: SyncResult<()>,
    },
}

/// The context a remote event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding<'a> {
    /// One rebuild of the client configuration.
    Epoch(Epoch),
    /// One namespace path, across rebuilds of that path.
    Path(&'a NamespacePath),
}

impl RemoteEvent {
    pub fn binding(&self) -> Binding<'_> {
        match self {
            RemoteEvent::Child { epoch, .. }
            | RemoteEvent::TokenIssued { epoch, .. }
            | RemoteEvent::AuthCompleted { epoch, .. } => Binding::Epoch(*epoch),
            RemoteEvent::GetCompleted { path, .. } | RemoteEvent::SetCompleted { path, .. } => {
                Binding::Path(path)
            }
        }
    }
}

/// Everything the dispatcher reads.
#[derive(Debug)]
pub enum Envelope {
    Command(Command),
    Remote(RemoteEvent),
}

/// Cloneable, thread-safe sender into the dispatch context.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl DispatchSender {
    /// Creates the dispatch channel.
    pub fn channel() -> (DispatchSender, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DispatchSender { tx }, rx)
    }

    /// Posts a command. Returns false once the dispatcher is gone.
    pub fn command(&self, command: Command) -> bool {
        self.tx.send(Envelope::Command(command)).is_ok()
    }

    /// Posts a remote event. Never blocks, safe from any thread.
    pub fn post(&self, event: RemoteEvent) {
        if self.tx.send(Envelope::Remote(event)).is_err() {
            warn!("Dispatcher stopped; dropping remote event");
        }
    }
}
