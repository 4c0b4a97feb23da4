// =============================================================================
// Resilient HTTP Client — rate limit + circuit breaker + retry/backoff
// =============================================================================
//
// Every outbound request flows through:
//
//   1. Token-bucket consume for the request's call class (info / exchange).
//   2. Minimum inter-request spacing (extra safety throttle).
//   3. Circuit-breaker gate for the named operation.
//   4. reqwest send with a per-request timeout.
//   5. Response classification:
//        2xx                      -> success (closes a half-open probe)
//        408/429/5xx + transport  -> retry with exponential backoff + jitter
//        429 with Retry-After     -> the header always wins over the policy
//        everything else          -> fail immediately
//
// Failure accounting: 5xx and transport errors count toward the breaker; 429
// is waited out without counting; other 4xx count only when
// `count_client_errors_as_failures` is set.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use super::circuit::{CircuitBreakerRegistry, CircuitState};
use super::rate_limit::DualBucketRateLimiter;
use super::ResilienceError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Info,
    Exchange,
}

/// Tunables for the client. Defaults match the platform-wide contract.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_statuses: Vec<u16>,
    /// Extra safety throttle between any two requests from this client.
    pub min_spacing: Duration,
    pub request_timeout: Duration,
    /// Longest the rate limiter may block one request.
    pub max_rate_limit_wait: Duration,
    /// Count non-429 4xx responses as breaker failures.
    pub count_client_errors_as_failures: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
            min_spacing: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(60),
            count_client_errors_as_failures: false,
        }
    }
}

/// Health view per the platform contract: healthy iff the breaker is CLOSED
/// and the rolling error rate stays under 10 %.
#[derive(Debug, Clone, Serialize)]
pub struct HttpHealth {
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client shared by every collaborator-facing integration.
pub struct ResilientHttpClient {
    client: reqwest::Client,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<DualBucketRateLimiter>,
    config: HttpClientConfig,
    /// Breaker name used for the health view.
    primary_breaker: String,
    request_count: AtomicU64,
    error_count: AtomicU64,
    last_request_at: Mutex<Option<Instant>>,
}

impl ResilientHttpClient {
    /// Build the client. The `User-Agent` identifies the agent on every
    /// request per the upstream wire contract.
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<DualBucketRateLimiter>,
        config: HttpClientConfig,
        primary_breaker: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("argus-intel/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            breakers,
            limiter,
            config,
            primary_breaker: primary_breaker.into(),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_request_at: Mutex::new(None),
        })
    }

    /// Borrow the underlying reqwest client to build requests (GET/POST,
    /// headers, bodies); pass the builder back through [`request_json`].
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    // -------------------------------------------------------------------------
    // Main entry point
    // -------------------------------------------------------------------------

    /// Send `builder` with the full resilience pipeline and parse the response
    /// body as JSON. `weight` is the token cost (use
    /// [`DualBucketRateLimiter::exchange_batch_cost`] for batched submits).
    pub async fn request_json(
        &self,
        class: CallClass,
        breaker: &str,
        weight: u32,
        builder: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ResilienceError> {
        // 1. Rate limit.
        let outcome = match class {
            CallClass::Info => {
                self.limiter
                    .consume_info_and_wait(weight, self.config.max_rate_limit_wait)
                    .await
            }
            CallClass::Exchange => {
                self.limiter
                    .consume_exchange_and_wait(weight, self.config.max_rate_limit_wait)
                    .await
            }
        };
        if !outcome.allowed {
            return Err(ResilienceError::RateLimited {
                needed: weight,
                remaining: outcome.tokens_remaining,
            });
        }

        // 2. Retry loop.
        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            self.enforce_spacing().await;

            // 3. Breaker gate per attempt.
            self.breakers.admit(breaker)?;

            let request = match builder.try_clone() {
                Some(b) => b,
                None => {
                    self.breakers.record_neutral(breaker);
                    return Err(ResilienceError::Operation(anyhow::anyhow!(
                        "request body is not cloneable for retries"
                    )));
                }
            };

            self.request_count.fetch_add(1, Ordering::Relaxed);

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();

                    if response.status().is_success() {
                        self.breakers.record_success(breaker);
                        return response
                            .json::<serde_json::Value>()
                            .await
                            .map_err(|e| ResilienceError::Operation(e.into()));
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    last_error = format!("HTTP {status}: {body}");
                    self.error_count.fetch_add(1, Ordering::Relaxed);

                    let retryable = self.config.retry_statuses.contains(&status);

                    // Failure accounting.
                    if status == 429 {
                        self.breakers.record_neutral(breaker);
                    } else if status >= 500 || self.config.count_client_errors_as_failures {
                        self.breakers.record_failure(breaker);
                    } else {
                        self.breakers.record_neutral(breaker);
                    }

                    if !retryable {
                        return Err(ResilienceError::NonRetryable { status, body });
                    }
                    if attempt == self.config.max_retries {
                        break;
                    }

                    // Retry-After always wins over the exponential policy.
                    let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
                    debug!(
                        breaker,
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        honored_retry_after = retry_after.is_some(),
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Transport / DNS / timeout errors are retryable and count
                    // toward the breaker.
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    self.breakers.record_failure(breaker);
                    last_error = e.to_string();

                    if e.is_timeout() && attempt == self.config.max_retries {
                        return Err(ResilienceError::Timeout(
                            self.config.request_timeout.as_millis() as u64,
                        ));
                    }
                    if attempt == self.config.max_retries {
                        break;
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        breaker,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transport error — retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(breaker, last_error = %last_error, "retries exhausted");
        Err(ResilienceError::RetriesExhausted {
            attempts: self.config.max_retries + 1,
            last_error,
        })
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Health view per the platform contract.
    pub fn health(&self) -> HttpHealth {
        let requests = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let error_rate = if requests > 0 {
            errors as f64 / requests as f64
        } else {
            0.0
        };
        let circuit_state = self.breakers.breaker_status(&self.primary_breaker).state;

        HttpHealth {
            healthy: circuit_state == CircuitState::Closed && error_rate < 0.10,
            circuit_state,
            request_count: requests,
            error_count: errors,
            error_rate,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Exponential backoff: base * 2^attempt + up to 30 % jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exp = base_ms * 2f64.powi(attempt as i32);
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0.0..=0.30) * exp
        };
        let total = (exp + jitter).min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(total as u64)
    }

    /// Sleep until `min_spacing` has elapsed since the previous request.
    async fn enforce_spacing(&self) {
        let wait = {
            let mut last = self.last_request_at.lock();
            let now = Instant::now();
            let wait = match *last {
                Some(prev) => self
                    .config
                    .min_spacing
                    .checked_sub(now.duration_since(prev))
                    .unwrap_or(Duration::ZERO),
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("primary_breaker", &self.primary_breaker)
            .field("request_count", &self.request_count.load(Ordering::Relaxed))
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Retry-After parsing
// ---------------------------------------------------------------------------

/// Parse a `Retry-After` header: either delay-seconds or an HTTP date.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    // HTTP-date form (RFC 2822/7231).
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(Duration::from_secs(delta.num_seconds().max(0) as u64))
}
