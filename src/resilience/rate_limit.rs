// =============================================================================
// Rate Limiters — lazily refilled token buckets with weighted cost
// =============================================================================
//
// One bucket = { capacity, refill_rate per interval, interval }. Refill is
// lazy: each consume() computes how many whole intervals elapsed since the
// last refill, credits interval_count * refill_rate tokens (capped at
// capacity), and advances the refill clock by the consumed intervals only, so
// fractional interval remainders are never lost.
//
// The dual-bucket limiter keeps two independent buckets for the two call
// classes the engine makes: "info" (market data, news, LLM) and "exchange"
// (order placement). A batched exchange submit of k items costs 1 + k/40
// tokens (the venue's batch discount).
// =============================================================================

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Outcome type
// ---------------------------------------------------------------------------

/// Result of a single consume attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// Suggested wait before retrying, present only when the caller asked for
    /// a blocking estimate and the bucket was short.
    pub wait_time_ms: Option<u64>,
}

/// Serialisable snapshot of both buckets for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub info_tokens: f64,
    pub info_capacity: u32,
    pub exchange_tokens: f64,
    pub exchange_capacity: u32,
}

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single lazily-refilled token bucket.
pub struct TokenBucket {
    capacity: u32,
    /// Tokens credited per elapsed interval.
    refill_rate: u32,
    interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: u32, interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            interval,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Credit tokens for every whole interval elapsed since the last refill.
    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let interval_ms = self.interval.as_millis().max(1) as u64;
        let intervals = elapsed.as_millis() as u64 / interval_ms;
        if intervals == 0 {
            return;
        }

        let credit = intervals.saturating_mul(self.refill_rate as u64) as f64;
        state.tokens = (state.tokens + credit).min(self.capacity as f64);
        // Advance by the consumed intervals only; the remainder keeps accruing.
        state.last_refill += Duration::from_millis(intervals * interval_ms);
    }

    /// Try to take `n` tokens. With `blocking`, a short bucket also reports
    /// how long the caller would need to wait for the deficit to refill.
    pub fn consume(&self, n: u32, blocking: bool) -> ConsumeOutcome {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            return ConsumeOutcome {
                allowed: true,
                tokens_remaining: state.tokens,
                wait_time_ms: None,
            };
        }

        let wait_time_ms = if blocking {
            let deficit = n as f64 - state.tokens;
            let intervals_needed = (deficit / self.refill_rate as f64).ceil();
            Some((intervals_needed * self.interval.as_millis() as f64) as u64)
        } else {
            None
        };

        ConsumeOutcome {
            allowed: false,
            tokens_remaining: state.tokens,
            wait_time_ms,
        }
    }

    /// Consume `n` tokens, sleeping through the computed deficit (plus up to
    /// 10 % uniform jitter, capped at `max_wait`) and retrying once. The
    /// jitter is additive only so the retry always lands after the refill.
    pub async fn consume_and_wait(&self, n: u32, max_wait: Duration) -> ConsumeOutcome {
        let first = self.consume(n, true);
        if first.allowed {
            return first;
        }

        let base_ms = first.wait_time_ms.unwrap_or(0);
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0.0..=0.10)
        };
        let wait_ms = ((base_ms as f64 * (1.0 + jitter)) as u64).min(max_wait.as_millis() as u64);

        debug!(
            needed = n,
            remaining = first.tokens_remaining,
            wait_ms,
            "bucket short — waiting before retry"
        );
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        let second = self.consume(n, false);
        if !second.allowed {
            warn!(
                needed = n,
                remaining = second.tokens_remaining,
                "bucket still short after wait"
            );
        }
        second
    }

    /// Current token count (after lazy refill).
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("interval", &self.interval)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DualBucketRateLimiter
// ---------------------------------------------------------------------------

/// Items per extra exchange token in a batched submit.
const BATCH_DISCOUNT_SIZE: u32 = 40;

/// Two independent buckets: one for informational calls, one for exchange
/// (order) calls.
pub struct DualBucketRateLimiter {
    info: TokenBucket,
    exchange: TokenBucket,
}

impl DualBucketRateLimiter {
    pub fn new(info: TokenBucket, exchange: TokenBucket) -> Self {
        Self { info, exchange }
    }

    /// Defaults sized for a polling news/prediction engine: 60 info calls and
    /// 10 exchange calls per 10-second window.
    pub fn with_defaults() -> Self {
        Self::new(
            TokenBucket::new(60, 60, Duration::from_secs(10)),
            TokenBucket::new(10, 10, Duration::from_secs(10)),
        )
    }

    /// Weighted cost of a batched exchange submit of `k` items.
    pub fn exchange_batch_cost(k: u32) -> u32 {
        1 + k / BATCH_DISCOUNT_SIZE
    }

    pub fn consume_info(&self, n: u32, blocking: bool) -> ConsumeOutcome {
        self.info.consume(n, blocking)
    }

    pub fn consume_exchange(&self, n: u32, blocking: bool) -> ConsumeOutcome {
        self.exchange.consume(n, blocking)
    }

    pub async fn consume_info_and_wait(&self, n: u32, max_wait: Duration) -> ConsumeOutcome {
        self.info.consume_and_wait(n, max_wait).await
    }

    pub async fn consume_exchange_and_wait(&self, n: u32, max_wait: Duration) -> ConsumeOutcome {
        self.exchange.consume_and_wait(n, max_wait).await
    }

    /// Snapshot both buckets for the dashboard payload.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            info_tokens: self.info.tokens(),
            info_capacity: self.info.capacity(),
            exchange_tokens: self.exchange.tokens(),
            exchange_capacity: self.exchange.capacity(),
        }
    }
}

impl std::fmt::Debug for DualBucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualBucketRateLimiter")
            .field("info", &self.info)
            .field("exchange", &self.exchange)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_within_capacity() {
        let bucket = TokenBucket::new(10, 10, Duration::from_secs(1));
        let out = bucket.consume(4, false);
        assert!(out.allowed);
        assert!((out.tokens_remaining - 6.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn non_blocking_denial_reports_remaining() {
        let bucket = TokenBucket::new(3, 3, Duration::from_secs(1));
        assert!(bucket.consume(3, false).allowed);

        let out = bucket.consume(1, false);
        assert!(!out.allowed);
        assert!(out.wait_time_ms.is_none());
        assert!(out.tokens_remaining < 1.0);
    }

    #[tokio::test]
    async fn blocking_denial_computes_wait() {
        let bucket = TokenBucket::new(10, 5, Duration::from_millis(1000));
        assert!(bucket.consume(10, false).allowed);

        // Need 4 tokens, refill is 5/interval => one interval.
        let out = bucket.consume(4, true);
        assert!(!out.allowed);
        assert_eq!(out.wait_time_ms, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(10, 2, Duration::from_secs(1));
        assert!(bucket.consume(10, false).allowed);

        tokio::time::advance(Duration::from_secs(3)).await;
        // 3 intervals * 2 tokens = 6 credited.
        assert!((bucket.tokens() - 6.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(60)).await;
        // Never exceeds capacity.
        assert!((bucket.tokens() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn consume_and_wait_retries_after_sleep() {
        let bucket = TokenBucket::new(2, 2, Duration::from_millis(100));
        assert!(bucket.consume(2, false).allowed);

        // Paused clock: the sleep inside consume_and_wait auto-advances, after
        // which the refill covers the request.
        let out = bucket.consume_and_wait(2, Duration::from_secs(5)).await;
        assert!(out.allowed);
    }

    #[test]
    fn exchange_batch_cost_discount() {
        assert_eq!(DualBucketRateLimiter::exchange_batch_cost(0), 1);
        assert_eq!(DualBucketRateLimiter::exchange_batch_cost(39), 1);
        assert_eq!(DualBucketRateLimiter::exchange_batch_cost(40), 2);
        assert_eq!(DualBucketRateLimiter::exchange_batch_cost(119), 3);
    }

    #[test]
    fn dual_buckets_are_independent() {
        let limiter = DualBucketRateLimiter::new(
            TokenBucket::new(5, 5, Duration::from_secs(1)),
            TokenBucket::new(2, 2, Duration::from_secs(1)),
        );
        assert!(limiter.consume_exchange(2, false).allowed);
        assert!(!limiter.consume_exchange(1, false).allowed);
        // Info bucket unaffected.
        assert!(limiter.consume_info(5, false).allowed);
    }
}
