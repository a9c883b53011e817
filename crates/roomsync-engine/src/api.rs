use std::future::Future;

use async_trait::async_trait;
use roomsync_core::{
    Direction, EngineError, ErrorCategory, MessagesResponse, RetryPolicy, SyncResponse,
    classify_http_status,
};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Parameters of one incremental sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub since: Option<String>,
    pub filter_id: Option<String>,
    pub timeout_ms: u64,
}

/// Failures reported by the homeserver transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("rate limited by homeserver")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("homeserver rejected request ({status} {errcode}): {message}")]
    Rejected {
        status: u16,
        errcode: String,
        message: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Timeouts and connection failures; the same request can be retried later.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Timeout | ApiError::Connection(_))
    }
}

/// The remote endpoints the engine talks to.
#[async_trait]
pub trait HomeServerApi: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ApiError>;

    async fn messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: u16,
    ) -> Result<MessagesResponse, ApiError>;

    /// Send one event; repeating a transaction id must not duplicate it.
    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<String, ApiError>;

    /// Upload media and return its content URI.
    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<String, ApiError>;

    async fn create_filter(&self, user_id: &str, filter: Value) -> Result<String, ApiError>;
}

/// Run `request`, waiting and retrying while the server rate-limits it.
///
/// Gives up with the last `RateLimited` error once the policy's attempt
/// budget is spent. Other errors are returned unchanged.
pub(crate) async fn retry_rate_limited<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut request: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut retries: u32 = 0;
    loop {
        match request().await {
            Err(ApiError::RateLimited { retry_after_ms })
                if policy.allows_rate_limit_retry(retries) =>
            {
                let delay = policy.delay_for_attempt(retries, retry_after_ms);
                retries = retries.saturating_add(1);
                warn!(
                    operation,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

pub(crate) fn map_api_error(operation: &str, err: ApiError) -> EngineError {
    match err {
        ApiError::Timeout => EngineError::new(
            ErrorCategory::Network,
            "request_timeout",
            format!("{operation} timed out"),
        ),
        ApiError::Connection(message) => EngineError::new(
            ErrorCategory::Network,
            "connection_error",
            format!("{operation} failed: {message}"),
        ),
        ApiError::RateLimited { retry_after_ms } => EngineError {
            category: ErrorCategory::RateLimited,
            code: "rate_limited".to_owned(),
            message: format!("{operation} was rate limited"),
            retry_after_ms,
        },
        ApiError::Rejected {
            status,
            errcode,
            message,
        } => EngineError::new(
            classify_http_status(status),
            errcode,
            format!("{operation} rejected with {status}: {message}"),
        ),
        ApiError::Malformed(message) => EngineError::new(
            ErrorCategory::Serialization,
            "malformed_response",
            format!("{operation} returned a malformed body: {message}"),
        ),
    }
}
