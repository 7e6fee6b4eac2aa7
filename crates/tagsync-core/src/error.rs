//! # Error Types
//!
//! Codec errors for tagsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tagsync-core errors (this file)                                       │
//! │  └── CodecError       - Value not representable / wire text malformed  │
//! │                                                                         │
//! │  tagsync errors (client crate)                                         │
//! │  └── SyncError        - Remote operations, auth, transport, config     │
//! │                                                                         │
//! │  Flow: CodecError → SyncError::Codec → "error" event                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failures converting between [`crate::Value`] and wire text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value contains something the wire format cannot represent.
    ///
    /// ## When This Occurs
    /// - A float is NaN or infinite
    /// - A serialized struct uses non-string map keys
    #[error("Value failed to convert to JSON: {0}")]
    Encoding(String),

    /// The wire text is not valid JSON.
    #[error("Value failed to convert from JSON: {0}")]
    Decoding(String),
}

impl CodecError {
    /// Returns true for encode-side failures.
    pub fn is_encoding(&self) -> bool {
        matches!(self, CodecError::Encoding(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodecError::Encoding("non-finite number".into());
        assert!(err.to_string().contains("to JSON"));
        assert!(err.is_encoding());

        let err = CodecError::Decoding("expected value at line 1".into());
        assert!(err.to_string().contains("from JSON"));
        assert!(!err.is_encoding());
    }
}
