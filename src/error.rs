// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the distribution engine.
//!
//! Errors are categorized by where they surface: synchronous request
//! handling (config CRUD, export, import, pull) returns them directly to the
//! caller, while queued delivery classifies them with
//! [`DistributionError::is_retryable()`] to decide between backoff and the
//! ERROR state.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `NotFound` | No | Unknown agent, queue, item, endpoint or content path |
//! | `Conflict` | No | Agent name already configured |
//! | `Validation` | No | Malformed request or option value |
//! | `Export` | No | Source repository failed to produce a package |
//! | `Import` | Yes | Target repository temporarily failed to apply |
//! | `ImportRejected` | No | Target refused the package (validation failure) |
//! | `Transport` | Yes | Endpoint unreachable |
//! | `MalformedPackage` | No | Package bytes or checksum are corrupt |
//! | `QueueFull` | No | Bounded queue at capacity |
//! | `RetryExhausted` | No | Item moved to ERROR (internal signal) |
//! | `Config` | No | Configuration invalid |
//! | `Settings` | No | Settings store write failed |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `InvalidState` | No | Agent state machine violation |
//! | `Shutdown` | No | Agent is shutting down |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for distribution operations.
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Errors that can occur while distributing content.
#[derive(Error, Debug)]
pub enum DistributionError {
    /// A named resource does not exist (404-equivalent).
    ///
    /// `kind` is one of `agent`, `queue`, `item`, `endpoint`, `path`.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// An agent with this name is already configured (409-equivalent).
    #[error("agent already exists: {0}")]
    Conflict(String),

    /// The request or an option value is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The source repository failed while exporting.
    #[error("Export error ({path}): {message}")]
    Export { path: String, message: String },

    /// The target repository failed while importing.
    ///
    /// Treated as transient: queued delivery backs off and retries.
    #[error("Import error (package {package_id}): {message}")]
    Import { package_id: String, message: String },

    /// The target repository refused the package.
    ///
    /// Retrying cannot help, so the queue item goes straight to ERROR.
    #[error("Import rejected (package {package_id}): {message}")]
    ImportRejected { package_id: String, message: String },

    /// The endpoint could not be reached.
    #[error("Transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// Package bytes could not be decoded or failed checksum validation.
    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    /// A bounded queue is at capacity.
    #[error("Queue full ({queue}): capacity {capacity}")]
    QueueFull { queue: String, capacity: usize },

    /// A queue item used up its delivery attempts.
    ///
    /// Never returned from `distribute`; only visible through queue inspection.
    #[error("Retries exhausted for item {item_id} after {attempts} attempts")]
    RetryExhausted { item_id: String, attempts: u32 },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The settings store refused a write.
    #[error("Settings store error: {0}")]
    Settings(String),

    /// SQLite error in the durable queue store.
    #[error("Queue store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Agent state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DistributionError {
    /// Shorthand for [`DistributionError::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Check if queued delivery should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Import { .. } => true,
            Self::Transport { .. } => true,
            Self::NotFound { .. } => false,
            Self::Conflict(_) => false,
            Self::Validation(_) => false,
            Self::Export { .. } => false,
            Self::ImportRejected { .. } => false,
            Self::MalformedPackage(_) => false, // Corrupt at the source
            Self::QueueFull { .. } => false,
            Self::RetryExhausted { .. } => false,
            Self::Config(_) => false,
            Self::Settings(_) => false,
            Self::Store(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// HTTP-equivalent status for the resource layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Validation(_) | Self::MalformedPackage(_) => 400,
            Self::QueueFull { .. } | Self::Shutdown => 503,
            Self::InvalidState { .. } => 409,
            _ => 500,
        }
    }

    /// Short label used for metrics and agent log entries.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Export { .. } => "export",
            Self::Import { .. } => "import",
            Self::ImportRejected { .. } => "import_rejected",
            Self::Transport { .. } => "transport",
            Self::MalformedPackage(_) => "malformed_package",
            Self::QueueFull { .. } => "queue_full",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Config(_) => "config",
            Self::Settings(_) => "settings",
            Self::Store(_) => "store",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
