// =============================================================================
// Resilience Runtime — shared fault-tolerance primitives
// =============================================================================
//
// Everything that talks to the outside world goes through this module:
//   - circuit:    per-operation circuit breakers + health aggregation
//   - rate_limit: dual token-bucket throttling (info vs exchange calls)
//   - http:       resilient HTTP client composing the two with retry/backoff
//   - snapshot:   point-in-time state snapshots with diff and restore
//   - overfill:   exchange-fill reconciliation against recorded orders
// =============================================================================

pub mod circuit;
pub mod http;
pub mod overfill;
pub mod rate_limit;
pub mod snapshot;

use thiserror::Error;

/// Closed error set of the resilience runtime. Callers match on the kind to
/// decide between fallback, skip, and propagation.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("rate limited: needed {needed} tokens, {remaining:.2} remaining")]
    RateLimited { needed: u32, remaining: f64 },

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("non-retryable HTTP status {status}: {body}")]
    NonRetryable { status: u16, body: String },

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

impl ResilienceError {
    /// True for failure kinds that a caller may meaningfully retry later
    /// (the client itself has already exhausted its own retry budget).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::Timeout(_)
                | Self::RetriesExhausted { .. }
        )
    }
}
