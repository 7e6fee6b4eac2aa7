//! # Listener Lifecycle
//!
//! Owns the client's one live subscription.
//!
//! ## Reconfigure Ordering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   active: Some(P1 @ epoch 3)                                           │
//! │                                                                         │
//! │   1. teardown()          unsubscribe P1, active = None                 │
//! │   2. (auth for P2)       driven by the client                          │
//! │   3. subscribe(P2, 4)    active = Some(P2 @ epoch 4)                   │
//! │                                                                         │
//! │   late P1 event (epoch 3) ──► accept() ──► dropped                     │
//! │   P2 event (epoch 4)      ──► accept() ──► Notification                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Added, changed and removed children all become one
//! [`Notification::ValueChanged`]; removal carries no value.

use std::sync::Arc;

use tagsync_core::NamespacePath;
use tracing::{debug, info};

use crate::dispatch::{DispatchSender, Epoch, RemoteEvent};
use crate::store::{ChildEvent, ChildListener, RemoteStoreHandle, Subscription};

/// The subscription currently delivering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub path: NamespacePath,
    pub subscription: Subscription,
    pub epoch: Epoch,
}

/// What an accepted child event means to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `wire` is `None` when the tag was removed.
    ValueChanged { tag: String, wire: Option<String> },
    /// The backend ended the subscription.
    Cancelled { message: String },
}

/// Holds at most one live subscription.
#[derive(Debug, Default)]
pub struct ListenerLifecycle {
    active: Option<ActiveSubscription>,
}

impl ListenerLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ActiveSubscription> {
        self.active.as_ref()
    }

    /// True when a live subscription targets `path`.
    pub fn is_active_for(&self, path: &NamespacePath) -> bool {
        self.active.as_ref().is_some_and(|a| a.path == *path)
    }

    /// Releases the live subscription, if any.
    pub fn teardown(&mut self, handle: &RemoteStoreHandle) {
        if let Some(active) = self.active.take() {
            info!(path = %active.path, subscription = %active.subscription, "Unsubscribing");
            handle.unsubscribe(active.subscription);
        }
    }

    /// Subscribes to the handle's path under `epoch`. Any previous
    /// subscription is released first.
    pub fn subscribe(&mut self, handle: &RemoteStoreHandle, epoch: Epoch, sender: DispatchSender) {
        self.teardown(handle);

        let listener: ChildListener = Arc::new(move |event| {
            sender.post(RemoteEvent::Child { epoch, event });
        });
        let subscription = handle.subscribe_children(listener);
        info!(path = %handle.path(), %subscription, %epoch, "Subscribed");

        self.active = Some(ActiveSubscription {
            path: handle.path().clone(),
            subscription,
            epoch,
        });
    }

    /// Translates a child event, or drops it if it belongs to a released
    /// subscription.
    pub fn accept(&mut self, epoch: Epoch, event: ChildEvent) -> Option<Notification> {
        let current = match &self.active {
            Some(active) if active.epoch == epoch => active,
            _ => {
                debug!(%epoch, "Dropping child event from released subscription");
                return None;
            }
        };

        Some(match event {
            ChildEvent::Added { tag, value } | ChildEvent::Changed { tag, value } => {
                Notification::ValueChanged {
                    tag,
                    wire: Some(value),
                }
            }
            ChildEvent::Removed { tag } => Notification::ValueChanged { tag, wire: None },
            ChildEvent::Cancelled { message } => {
                info!(path = %current.path, %message, "Subscription cancelled by store");
                // The store already ended it; the next reconfigure resubscribes.
                self.active = None;
                Notification::Cancelled { message }
            }
        })
    }
}
