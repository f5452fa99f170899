// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync coordinator.
//!
//! Errors are categorized by what failed (source stream, target database,
//! checkpoint storage) and carry enough context to tell an operator what
//! needs fixing.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Connection` | Yes | No | Source or target unreachable, stream dropped |
//! | `Transient` | Yes | No | Lock timeout, serialization failure, deadlock |
//! | `Decode` | No | Yes | Malformed replication stream |
//! | `ConstraintViolation` | No | Yes | Target rejected a mutation (schema mismatch) |
//! | `Storage` | No | Yes | Checkpoint could not be recorded |
//! | `LeaseHeld` | No | Yes | Another instance owns this table-set |
//! | `Config` | No | No | Configuration invalid |
//! | `InvalidState` | No | No | Lifecycle state machine violation |
//! | `Shutdown` | No | No | Coordinator is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] tells the caller whether backing off and
//! trying again can help. [`SyncError::is_fatal()`] marks errors that must
//! halt synchronization until an operator intervenes: retrying them cannot
//! fix a schema or protocol mismatch, and continuing past a storage failure
//! would lose track of progress.

use crate::event::Lsn;
use crate::target::TargetError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing a table-set.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Source or target unreachable.
    ///
    /// Retried with backoff by the coordinator (reader reconnect) or by the
    /// retry controller (target connection dropped mid-batch).
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// Malformed replication stream.
    ///
    /// The source sent bytes we cannot interpret. Never retried.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The target rejected a mutation.
    ///
    /// Usually a schema mismatch between source and target tables.
    #[error("Constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    /// Lock timeout, serialization failure or similar.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Checkpoint storage failure.
    ///
    /// Progress cannot be recorded safely, so synchronization stops.
    #[error("Checkpoint storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Checkpoint write rejected because it would move the position backwards.
    #[error("Checkpoint regression: stored {stored}, attempted {attempted}")]
    CheckpointRegression { stored: Lsn, attempted: Lsn },

    /// Another coordinator holds the lease for this table-set.
    #[error("Lease for {set_name} is held by {holder}")]
    LeaseHeld { set_name: String, holder: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// E.g. calling `start()` on a running coordinator.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a connection error for an endpoint.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create a constraint violation for a table.
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Transient(_) => true,
            Self::Decode(_) => false, // Protocol mismatch
            Self::ConstraintViolation { .. } => false, // Schema mismatch
            Self::Storage(_) => false,
            Self::CheckpointRegression { .. } => false,
            Self::LeaseHeld { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must halt synchronization.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::ConstraintViolation { .. }
                | Self::Storage(_)
                | Self::CheckpointRegression { .. }
                | Self::LeaseHeld { .. }
        )
    }

    /// Short machine-readable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Decode(_) => "decode",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::Transient(_) => "transient",
            Self::Storage(_) => "storage",
            Self::CheckpointRegression { .. } => "checkpoint_regression",
            Self::LeaseHeld { .. } => "lease_held",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<TargetError> for SyncError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::ConstraintViolation { table, message } => {
                Self::ConstraintViolation { table, message }
            }
            TargetError::Transient(message) => Self::Transient(message),
            TargetError::Connection(message) => Self::connection("target", message),
        }
    }
}
