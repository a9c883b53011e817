use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SyncStatus;

/// Broad error category used for retry decisions and user-facing status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// Encryption collaborator failure.
    Crypto,
    /// Local transactional store failure.
    Storage,
    /// Serialization/deserialization failure of persisted records.
    Serialization,
    /// Ordering or fragment-graph contradiction, or a malformed server payload.
    Consistency,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable engine error payload surfaced to callers and observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a consistency error (fragment graph, ordering, malformed payloads).
    pub fn consistency(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Consistency, code, message)
    }

    /// Build a standard invalid sync-state-transition error.
    pub fn invalid_state(current: SyncStatus, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while sync is in state {current:?}"),
        )
    }

    /// Whether the failure is transient and the same request may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}
