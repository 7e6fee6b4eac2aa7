//! # Sync Error Types
//!
//! Error types for client operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Remote Store  │  │     Authentication      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Remote         │  │  AuthFailed             │ │
//! │  │  InvalidUrl     │  │  PermissionDen. │  │  MissingCredential      │ │
//! │  │  ConfigLoad/Save│  │  Codec          │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Transport    │  │    Protocol     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Connection     │  │  InvalidMessage │  │  StaleResult (dropped)  │ │
//! │  │  Disconnected   │  │  Serialization  │  │  ShuttingDown           │ │
//! │  │  Timeout        │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here terminates the process. Inside the dispatcher every error is
//! turned into an "error" event, except `StaleResult` which is dropped.

use std::fmt;

use tagsync_core::CodecError;
use thiserror::Error;

/// Result type alias for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// The remote primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    Subscribe,
    Get,
    Set,
    Authenticate,
    IssueToken,
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteOperation::Subscribe => write!(f, "subscribe"),
            RemoteOperation::Get => write!(f, "get"),
            RemoteOperation::Set => write!(f, "set"),
            RemoteOperation::Authenticate => write!(f, "authenticate"),
            RemoteOperation::IssueToken => write!(f, "issue token"),
        }
    }
}

/// Client error type covering all possible failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Endpoint could not be parsed as a URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Value Errors
    // =========================================================================
    /// Value could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    // =========================================================================
    // Remote Store Errors
    // =========================================================================
    /// A remote primitive failed at the backend.
    #[error("Remote {operation} failed: {message}")]
    Remote {
        operation: RemoteOperation,
        message: String,
    },

    /// The backend rejected access to a path.
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Token rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Path requires a credential and none is set or issuable.
    #[error("No credential available for {0}")]
    MissingCredential(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped while a request was in flight.
    #[error("Disconnected from remote store")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize or parse a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A completion arrived for a superseded configuration.
    #[error("Stale result for {stamp} (current {current})")]
    StaleResult { stamp: String, current: String },

    /// Client is shutting down.
    #[error("Client is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// Shorthand for [`SyncError::Remote`].
    pub fn remote(operation: RemoteOperation, message: impl Into<String>) -> Self {
        SyncError::Remote {
            operation,
            message: message.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Url(u) => SyncError::InvalidUrl(u.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::AuthFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the transport may succeed on a later attempt.
    ///
    /// The client itself never retries remote operations; this only drives
    /// the WebSocket reconnect loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::MissingCredential(_)
        )
    }

    /// Returns true for completions belonging to a superseded configuration.
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::StaleResult { .. })
    }
}
