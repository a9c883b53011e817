use std::time::Duration;

/// Exponential backoff shared by the sync loop, gap fills and the send queue.
///
/// Transport failures retry forever with growing delays; rate limiting is
/// bounded by `max_rate_limit_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_rate_limit_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_rate_limit_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            max_rate_limit_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_rate_limit_attempts(&self) -> u32 {
        self.max_rate_limit_attempts
    }

    /// Delay before retry number `attempt` (zero based).
    ///
    /// A server-provided hint wins when it is longer than the computed delay,
    /// but never exceeds the policy maximum.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        Duration::from_millis(calculated.max(hinted).min(self.max_delay_ms))
    }

    /// Whether another rate-limited attempt is allowed after `attempts` tries.
    pub fn allows_rate_limit_retry(&self, attempts: u32) -> bool {
        attempts < self.max_rate_limit_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000, 5)
    }
}
