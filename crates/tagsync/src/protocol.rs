//! # Store Wire Protocol
//!
//! Messages exchanged between [`crate::store::ws::WsRemoteStore`] and a hub.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Store Protocol Messages                            │
//! │                                                                         │
//! │  SESSION                                                               │
//! │  ───────                                                               │
//! │  CLIENT ───► Authenticate { request_id, path, token }                  │
//! │  HUB    ◄─── Ack { request_id } | Failed { request_id, message }       │
//! │                                                                         │
//! │  SUBSCRIPTIONS                                                         │
//! │  ─────────────                                                         │
//! │  CLIENT ───► Subscribe { subscription_id, path }                       │
//! │  HUB    ◄─── Child { subscription_id, kind, tag, value }  (repeated)   │
//! │  HUB    ◄─── Cancelled { subscription_id, message }                    │
//! │  CLIENT ───► Unsubscribe { subscription_id }                           │
//! │                                                                         │
//! │  VALUES                                                                │
//! │  ──────                                                                │
//! │  CLIENT ───► Get { request_id, path, tag }                             │
//! │  HUB    ◄─── Value { request_id, value } | Failed { .. }               │
//! │  CLIENT ───► Set { request_id, path, tag, value }   (None removes)     │
//! │  HUB    ◄─── Ack { request_id } | Failed { .. }                        │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  Both   ◄──► Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Get", "payload": { "request_id": 7, "path": "proj1", "tag": "score" } }
//! ```
//!
//! `path` is the node path on the hub; the endpoint is the socket itself.
//! Values travel as codec wire text, never re-parsed by the hub.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of change a `Child` message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    Added,
    Changed,
    Removed,
}

/// All store protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StoreMessage {
    // =========================================================================
    // Client → Hub
    // =========================================================================
    /// Bind a token to a path for the rest of the connection.
    Authenticate {
        request_id: u64,
        path: String,
        token: String,
    },

    /// Start receiving child events for a path.
    Subscribe { subscription_id: Uuid, path: String },

    /// Stop receiving child events.
    Unsubscribe { subscription_id: Uuid },

    /// Read one tag once.
    Get {
        request_id: u64,
        path: String,
        tag: String,
    },

    /// Write one tag. `None` removes it.
    Set {
        request_id: u64,
        path: String,
        tag: String,
        value: Option<String>,
    },

    // =========================================================================
    // Hub → Client
    // =========================================================================
    /// Request succeeded without a payload.
    Ack { request_id: u64 },

    /// Result of a `Get`. `None` means no value at the tag.
    Value {
        request_id: u64,
        value: Option<String>,
    },

    /// Request failed at the hub.
    Failed { request_id: u64, message: String },

    /// A child of a subscribed path changed.
    Child {
        subscription_id: Uuid,
        kind: ChildKind,
        tag: String,
        value: Option<String>,
    },

    /// The hub ended a subscription.
    Cancelled {
        subscription_id: Uuid,
        message: String,
    },

    // =========================================================================
    // Both Ways
    // =========================================================================
    /// Protocol-level error not tied to a request.
    Error { code: String, message: String },
}

impl StoreMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreMessage::Authenticate { .. } => "Authenticate",
            StoreMessage::Subscribe { .. } => "Subscribe",
            StoreMessage::Unsubscribe { .. } => "Unsubscribe",
            StoreMessage::Get { .. } => "Get",
            StoreMessage::Set { .. } => "Set",
            StoreMessage::Ack { .. } => "Ack",
            StoreMessage::Value { .. } => "Value",
            StoreMessage::Failed { .. } => "Failed",
            StoreMessage::Child { .. } => "Child",
            StoreMessage::Cancelled { .. } => "Cancelled",
            StoreMessage::Error { .. } => "Error",
        }
    }

    /// Request id of a reply, if this message answers a request.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            StoreMessage::Ack { request_id }
            | StoreMessage::Value { request_id, .. }
            | StoreMessage::Failed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Creates an error message.
    pub fn error(code: &str, message: &str) -> Self {
        StoreMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
