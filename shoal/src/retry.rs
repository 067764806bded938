//! Backoff arithmetic for task retries and claim conflicts.

use std::time::Duration;

/// Attempts a claimer makes against a contended group head before yielding
/// back to the poll loop.
pub const CLAIM_ATTEMPTS: u32 = 3;

/// Initial backoff between claim attempts.
pub const CLAIM_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Backoff before the next execution of a failed task.
///
/// Formula: `base_ms × 2^(attempts-1)`, capped at `cap_ms`. `attempts` is
/// the number of executions already made; zero yields no delay.
pub fn compute_retry_delay(attempts: u32, base_ms: u64, cap_ms: u64) -> Duration {
    if attempts == 0 || base_ms == 0 {
        return Duration::ZERO;
    }
    let exp = attempts.saturating_sub(1).min(32);
    let scaled = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(scaled.min(cap_ms))
}

/// Whether a task that just failed its `attempts`-th execution has
/// exhausted its retry budget.
pub fn is_final_attempt(attempts: u32, max_retries: u32) -> bool {
    attempts > max_retries
}

/// Backoff before claim attempt `attempt` (zero-based): doubles from
/// [`CLAIM_BACKOFF_INITIAL`].
pub fn claim_backoff(attempt: u32) -> Duration {
    CLAIM_BACKOFF_INITIAL * 2u32.saturating_pow(attempt)
}
