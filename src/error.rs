//! Error types for frame decoding, command dispatch and the socket layer.
//!
//! None of these are fatal. The dispatcher records them per command in a
//! [`DispatchReport`](crate::dispatcher::DispatchReport) and logs them; the
//! connection turns transport errors into a scheduled reconnect.

use thiserror::Error;

/// Errors produced while decoding a frame or applying one of its commands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// The frame was not valid JSON, or not a JSON object.
    #[error("Unable to parse frame: {0}")]
    Parse(String),

    /// A recognized key carried a payload that does not match its schema.
    #[error("Malformed '{key}' payload: {reason}")]
    Malformed { key: &'static str, reason: String },

    /// A referenced object name (or uuid) is not in the registry.
    #[error("No {role} named '{name}' in the registry")]
    NotFound { role: &'static str, name: String },

    /// The payload asked for a geometry/material/object type we cannot build.
    #[error("Unsupported {kind} type '{type_name}'")]
    UnsupportedType { kind: &'static str, type_name: String },

    /// The named object exists but cannot play the requested role, e.g. a
    /// material used as a parent.
    #[error("'{name}' cannot be used here: {reason}")]
    InvalidTarget { name: String, reason: String },

    /// An asynchronous asset load failed.
    #[error("Failed to load '{path}': {reason}")]
    Load { path: String, reason: String },
}

impl DispatchError {
    pub fn malformed(key: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            key,
            reason: reason.to_string(),
        }
    }

    pub fn not_found(role: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            role,
            name: name.into(),
        }
    }

    pub fn invalid_target(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidTarget {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(kind: &'static str, type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            kind,
            type_name: type_name.into(),
        }
    }
}

/// Errors raised by a [`Transport`](crate::connection::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Socket is not open")]
    Closed,
}
