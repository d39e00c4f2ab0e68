//! # Error Handling
//!
//! Error types for the edgesync control plane, built with `thiserror`.
//!
//! Domain conflicts and inconsistent snapshots are distinguished variants so
//! that callers can reject a single route set (or a single pass) without
//! treating it as a failure of the whole subsystem.

use crate::xds::snapshot::ResourceKind;

/// Custom result type for edgesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the edgesync control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A resource could not be constructed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A domain is already served by another route set
    #[error("Domain conflict: '{domain}' requested by {owner} is already owned by {existing_owner}")]
    DomainConflict { domain: String, owner: String, existing_owner: String },

    /// Two different resources of the same kind share a name
    #[error("Duplicate {kind} resource '{name}' with differing contents")]
    DuplicateResource { kind: ResourceKind, name: String },

    /// A cross-kind reference does not resolve inside the snapshot
    #[error("Inconsistent snapshot: {kind} '{resource}' references missing '{reference}'")]
    InconsistentSnapshot { kind: ResourceKind, resource: String, reference: String },

    /// The proxy control endpoint rejected or failed a call
    #[error("Publish error for node '{node_id}': {message}")]
    Publish { node_id: String, message: String },

    /// A bounded operation did not finish in time
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Desired-state documents that fail to parse
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding(message.into())
    }

    /// Create a new publish error
    pub fn publish<N: Into<String>, S: Into<String>>(node_id: N, message: S) -> Self {
        Self::Publish { node_id: node_id.into(), message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// True for the per-owner conflict that leaves the store unchanged
    pub fn is_domain_conflict(&self) -> bool {
        matches!(self, Error::DomainConflict { .. })
    }

    /// Check if re-running the synchronization pass may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Publish { .. } | Error::Timeout { .. } | Error::Io(_))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field_errors = errors.field_errors();
        if field_errors.is_empty() {
            // Only nested structs failed; their Display carries the paths.
            return Self::Config(errors.to_string());
        }
        let message = field_errors
            .iter()
            .map(|(field, errs)| {
                let messages: Vec<String> = errs
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::Config(message)
    }
}
