//! Error types for the widget relay
//!
//! Protocol-level failures (bad frames, unknown states, broken deltas) are
//! absorbed by the dispatcher and only logged; `RelayError` reaches callers
//! from configuration, typed value conversion and handle operations.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failure while applying a structural delta
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("Delta node is not an object or array: {found}")]
    InvalidDelta { found: String },
    #[error("Array index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Invalid array delta key: {key}")]
    InvalidArrayKey { key: String },
    #[error("Unsupported delta operation code {code}")]
    UnsupportedOperation { code: i64 },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Errors produced by the widget relay crates
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid wire message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Unknown state: {name}")]
    UnknownState { name: String },

    #[error("Delta could not be applied: {0}")]
    Patch(#[from] PatchError),

    #[error("Value conversion failed for state {name}: {reason}")]
    ValueConversion { name: String, reason: String },

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Relay session is not running")]
    SessionClosed,
}

impl RelayError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn conversion(name: &str, err: serde_json::Error) -> Self {
        Self::ValueConversion {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the relay crates
pub type RelayResult<T> = Result<T, RelayError>;
