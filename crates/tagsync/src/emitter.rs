//! # Client Events
//!
//! The three events the client raises toward the application.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "value retrieved"  (tag, value)         GetValue / InitializeValue    │
//! │  "data changed"     (tag, value|absent)  remote push notification      │
//! │  "error"            (message)            any failed operation          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Emitters are only called from the dispatch context, one event at a time.

use tagsync_core::Value;
use tokio::sync::mpsc;

/// Receiver of client events.
pub trait SyncEventEmitter: Send + Sync {
    /// A requested value is available.
    fn emit_value_retrieved(&self, tag: &str, value: &Value);

    /// A value changed remotely. Removal arrives as [`Value::Absent`].
    fn emit_data_changed(&self, tag: &str, value: &Value);

    /// An operation failed.
    fn emit_error(&self, message: &str);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_value_retrieved(&self, _tag: &str, _value: &Value) {}
    fn emit_data_changed(&self, _tag: &str, _value: &Value) {}
    fn emit_error(&self, _message: &str) {}
}

/// An event as a value, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ValueRetrieved { tag: String, value: Value },
    DataChanged { tag: String, value: Value },
    Error { message: String },
}

/// Forwards events into an unbounded channel.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelEmitter {
    /// Creates the emitter and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelEmitter { tx }, rx)
    }

    fn send(&self, event: ClientEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl SyncEventEmitter for ChannelEmitter {
    fn emit_value_retrieved(&self, tag: &str, value: &Value) {
        self.send(ClientEvent::ValueRetrieved {
            tag: tag.to_string(),
            value: value.clone(),
        });
    }

    fn emit_data_changed(&self, tag: &str, value: &Value) {
        self.send(ClientEvent::DataChanged {
            tag: tag.to_string(),
            value: value.clone(),
        });
    }

    fn emit_error(&self, message: &str) {
        self.send(ClientEvent::Error {
            message: message.to_string(),
        });
    }
}
