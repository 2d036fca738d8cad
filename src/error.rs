//! Error types for taskbridge.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl Error {
    /// Whether a task that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => {
                e.is_retryable() || matches!(e, ProviderError::RetriesExhausted { .. })
            }
            Self::Bridge(e) => e.is_connectivity() || matches!(e, BridgeError::Stream { .. }),
            _ => false,
        }
    }

    /// Whether the work was cancelled by its caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Cancelled) | Self::Bridge(BridgeError::Cancelled { .. })
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable record store errors.
///
/// Every variant is recoverable: callers keep operating on in-memory state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Background execution channel errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge is not initialized")]
    NotInitialized,

    #[error("Failed to connect to background host at {target}: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("Background host disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Liveness probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Claim for {workflow_id} was not answered within {timeout:?}")]
    ClaimTimeout {
        workflow_id: String,
        timeout: Duration,
    },

    #[error("Request {correlation_id} was cancelled")]
    Cancelled { correlation_id: String },

    #[error("Request {correlation_id} failed: {message}")]
    Stream {
        correlation_id: String,
        message: String,
    },

    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),
}

impl BridgeError {
    /// Connectivity-class errors make the caller fall back to the direct path.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::ConnectFailed { .. }
                | Self::Disconnected(_)
                | Self::SendFailed(_)
                | Self::ProbeTimeout(_)
                | Self::ClaimTimeout { .. }
        )
    }
}

/// Generation provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} quota exceeded: {reason}")]
    QuotaExceeded { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        provider: String,
        attempts: u32,
        last: String,
    },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::QuotaExceeded { .. } | Self::Timeout { .. }
        )
    }
}

/// Task coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is already running")]
    AlreadyRunning { id: String },

    #[error("Task {id} is {status}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        status: String,
        target: String,
    },
}

/// Workflow step handler errors.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("No handler registered for step {0}")]
    UnknownHandler(String),

    #[error("Invalid step arguments: {0}")]
    InvalidArguments(String),

    #[error("Step failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
