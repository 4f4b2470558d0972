//! Error types for the delegate broker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl Error {
    /// True when a sync caller gave up waiting or the task finished without a response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Broker(e) if e.is_timeout())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task brokering errors surfaced to callers.
///
/// Missing capacity and scope mismatches are not here: they are raised as
/// alerts and never fail task creation. A lost claim race is reported as an
/// absent result, not an error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Timed out after {timeout:?} waiting for task {task_id}; it may still complete")]
    ExecutionTimeout { task_id: Uuid, timeout: Duration },

    #[error("Task {task_id} was deleted while waiting for completion")]
    TaskVanished { task_id: Uuid },

    #[error("Task {task_id} finished without a response from its delegate")]
    NoResponse { task_id: Uuid },

    #[error("Delegate {delegate_id} not found in account {account_id}")]
    DelegateNotFound {
        account_id: String,
        delegate_id: String,
    },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid delegate scope: {0}")]
    InvalidScope(String),
}

impl BrokerError {
    /// Timeout-class errors: the caller cannot tell whether the work happened.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. } | Self::NoResponse { .. })
    }
}

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;
