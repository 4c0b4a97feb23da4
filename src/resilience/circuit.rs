// =============================================================================
// Circuit Breakers — per-operation fault counters with half-open probing
// =============================================================================
//
// State machine per named operation:
//
//   CLOSED     — calls pass through; failures increment a counter.
//   OPEN       — calls short-circuit (fallback or CircuitOpen) until the
//                cooldown expires.
//   HALF_OPEN  — one probe call is admitted; success closes the breaker,
//                failure reopens it.
//
// CLOSED -> OPEN when failures >= threshold. OPEN -> HALF_OPEN after
// reset_after. The registry also aggregates collaborator-supplied health
// probes into an overall HEALTHY / DEGRADED / CRITICAL verdict.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::ResilienceError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Circuit state: pass-through, short-circuit, or single-probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of a single breaker for dashboards and the health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    /// ISO 8601 timestamp of the most recent failure, if any.
    pub last_failure_at: Option<String>,
    /// Milliseconds until the breaker re-admits a probe (0 when not open).
    pub open_remaining_ms: u64,
}

/// Health verdict for one probed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Down,
}

/// Latest probe result for one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub response_time_ms: u64,
    pub checked_at: String,
}

/// Overall verdict aggregated across breakers and probed components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

/// Aggregated health payload for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall: OverallHealth,
    pub breakers: Vec<BreakerStatus>,
    pub components: HashMap<String, ComponentHealth>,
}

/// A collaborator-supplied health probe for one named endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Internal breaker entry
// ---------------------------------------------------------------------------

struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<String>,
    open_until: Option<Instant>,
    /// True while a half-open probe call is in flight; only one is admitted.
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_at: None,
            open_until: None,
            probe_in_flight: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Probe latency above which a successful component is marked DEGRADED.
const DEGRADED_LATENCY_MS: u64 = 2_000;

/// Registry of named circuit breakers plus component health tracking.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, BreakerEntry>>,
    components: RwLock<HashMap<String, ComponentHealth>>,
    /// Failures before CLOSED trips to OPEN.
    failure_threshold: u32,
    /// Cooldown before an OPEN breaker admits a half-open probe.
    reset_after: Duration,
    health_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry. `failure_threshold` and `reset_after` apply to every
    /// named breaker; unknown names start CLOSED with zero failures.
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            components: RwLock::new(HashMap::new()),
            failure_threshold,
            reset_after,
            health_task: parking_lot::Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Gated execution
    // -------------------------------------------------------------------------

    /// Run `fut` behind the breaker `name`.
    ///
    /// OPEN (and still cooling down) short-circuits with
    /// [`ResilienceError::CircuitOpen`]. The breaker never retries
    /// internally.
    pub async fn execute<T, Fut>(&self, name: &str, fut: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.admit(name)?;

        match fut.await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(name);
                Err(ResilienceError::Operation(e))
            }
        }
    }

    /// Like [`execute`], but an OPEN breaker invokes `fallback` instead of
    /// failing.
    pub async fn execute_with_fallback<T, Fut, F>(
        &self,
        name: &str,
        fut: Fut,
        fallback: F,
    ) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
        F: FnOnce() -> T,
    {
        match self.execute(name, fut).await {
            Err(ResilienceError::CircuitOpen { .. }) => {
                debug!(breaker = name, "circuit open — invoking fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    /// Gate check: returns Ok(()) if the call may proceed. Transitions
    /// OPEN -> HALF_OPEN when the cooldown has expired and admits exactly one
    /// probe while half-open.
    ///
    /// Exposed at crate level so the HTTP client can drive the gate per
    /// attempt while applying its own failure classification.
    pub(crate) fn admit(&self, name: &str) -> Result<(), ResilienceError> {
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let expired = entry
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if expired {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    info!(breaker = name, "cooldown expired — admitting half-open probe");
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        name: name.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    // A probe is already out; everyone else keeps short-circuiting.
                    Err(ResilienceError::CircuitOpen {
                        name: name.to_string(),
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: HALF_OPEN closes, CLOSED zeroes failures.
    pub(crate) fn record_success(&self, name: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        if entry.state == CircuitState::HalfOpen {
            info!(breaker = name, "half-open probe succeeded — breaker closed");
        }
        entry.state = CircuitState::Closed;
        entry.failures = 0;
        entry.open_until = None;
        entry.probe_in_flight = false;
    }

    /// Record an outcome that counts neither as success nor failure (e.g. a
    /// 429 that will be waited out). Releases a half-open probe slot without
    /// changing state.
    pub(crate) fn record_neutral(&self, name: &str) {
        let mut breakers = self.breakers.write();
        if let Some(entry) = breakers.get_mut(name) {
            entry.probe_in_flight = false;
        }
    }

    /// Record a failed call: HALF_OPEN reopens immediately; CLOSED increments
    /// the failure counter and trips at the threshold.
    pub(crate) fn record_failure(&self, name: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.failures += 1;
        entry.last_failure_at = Some(Utc::now().to_rfc3339());
        entry.probe_in_flight = false;

        let should_open = match entry.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => entry.failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            entry.state = CircuitState::Open;
            entry.open_until = Some(Instant::now() + self.reset_after);
            warn!(
                breaker = name,
                failures = entry.failures,
                reset_after_ms = self.reset_after.as_millis() as u64,
                "circuit breaker opened"
            );
        } else {
            debug!(
                breaker = name,
                failures = entry.failures,
                threshold = self.failure_threshold,
                "breaker failure recorded"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Manual overrides & status
    // -------------------------------------------------------------------------

    /// Snapshot the state of one breaker. Unknown names read as CLOSED.
    pub fn breaker_status(&self, name: &str) -> BreakerStatus {
        let breakers = self.breakers.read();
        match breakers.get(name) {
            Some(entry) => BreakerStatus {
                name: name.to_string(),
                state: entry.state,
                failures: entry.failures,
                last_failure_at: entry.last_failure_at.clone(),
                open_remaining_ms: entry
                    .open_until
                    .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
                    .unwrap_or(0),
            },
            None => BreakerStatus {
                name: name.to_string(),
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at: None,
                open_remaining_ms: 0,
            },
        }
    }

    /// Snapshot every known breaker.
    pub fn all_breakers(&self) -> Vec<BreakerStatus> {
        let names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.iter().map(|n| self.breaker_status(n)).collect()
    }

    /// Force a breaker OPEN (admin override).
    pub fn open_breaker(&self, name: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);
        entry.state = CircuitState::Open;
        entry.open_until = Some(Instant::now() + self.reset_after);
        warn!(breaker = name, "circuit breaker opened manually");
    }

    /// Reset a breaker to CLOSED with zero failures (admin override).
    pub fn reset_breaker(&self, name: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);
        entry.state = CircuitState::Closed;
        entry.failures = 0;
        entry.open_until = None;
        entry.probe_in_flight = false;
        info!(breaker = name, "circuit breaker reset manually");
    }

    // -------------------------------------------------------------------------
    // Health checks
    // -------------------------------------------------------------------------

    /// Start the periodic health-check loop over the supplied probes.
    /// A second call replaces the previous loop.
    pub fn start_health_checks(
        self: &Arc<Self>,
        interval: Duration,
        probes: Vec<Arc<dyn HealthProbe>>,
    ) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for probe in &probes {
                    let started = Instant::now();
                    let result = probe.probe().await;
                    let elapsed_ms = started.elapsed().as_millis() as u64;

                    let status = match &result {
                        Ok(()) if elapsed_ms <= DEGRADED_LATENCY_MS => ComponentStatus::Ok,
                        Ok(()) => ComponentStatus::Degraded,
                        Err(_) => ComponentStatus::Down,
                    };

                    if let Err(e) = &result {
                        warn!(component = probe.name(), error = %e, "health probe failed");
                    } else {
                        debug!(
                            component = probe.name(),
                            elapsed_ms,
                            status = ?status,
                            "health probe completed"
                        );
                    }

                    registry.components.write().insert(
                        probe.name().to_string(),
                        ComponentHealth {
                            status,
                            response_time_ms: elapsed_ms,
                            checked_at: Utc::now().to_rfc3339(),
                        },
                    );
                }
            }
        });

        if let Some(old) = self.health_task.lock().replace(handle) {
            old.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "health checks started");
    }

    /// Stop the periodic health-check loop.
    pub fn stop_health_checks(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
            info!("health checks stopped");
        }
    }

    /// Aggregate breakers + components into one verdict:
    /// CRITICAL if any breaker is OPEN or any component is DOWN; DEGRADED if
    /// any breaker carries failures or any component is DEGRADED; else
    /// HEALTHY.
    pub fn health_summary(&self) -> HealthSummary {
        let breakers = self.all_breakers();
        let components = self.components.read().clone();

        let any_open = breakers.iter().any(|b| b.state == CircuitState::Open);
        let any_down = components
            .values()
            .any(|c| c.status == ComponentStatus::Down);
        let any_failures = breakers.iter().any(|b| b.failures > 0);
        let any_degraded = components
            .values()
            .any(|c| c.status == ComponentStatus::Degraded);

        let overall = if any_open || any_down {
            OverallHealth::Critical
        } else if any_failures || any_degraded {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        HealthSummary {
            overall,
            breakers,
            components,
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.read().len())
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_after", &self.reset_after)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, reset_ms: u64) -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(
            threshold,
            Duration::from_millis(reset_ms),
        ))
    }

    #[tokio::test]
    async fn unknown_breaker_reads_closed() {
        let reg = registry(3, 60_000);
        let status = reg.breaker_status("never-used");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failures, 0);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let reg = registry(3, 60_000);
        let out = reg
            .execute("venue", async { Ok::<_, anyhow::Error>(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(reg.breaker_status("venue").failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_then_half_open_then_closes() {
        let reg = registry(3, 60_000);

        // Three consecutive failures trip the breaker.
        for _ in 0..3 {
            let res = reg
                .execute("polymarket-clob", async {
                    Err::<(), _>(anyhow::anyhow!("boom"))
                })
                .await;
            assert!(matches!(res, Err(ResilienceError::Operation(_))));
        }
        assert_eq!(
            reg.breaker_status("polymarket-clob").state,
            CircuitState::Open
        );

        // While open: short-circuit.
        let res = reg
            .execute("polymarket-clob", async { Ok::<_, anyhow::Error>(1) })
            .await;
        assert!(matches!(res, Err(ResilienceError::CircuitOpen { .. })));

        // Fallback path is taken instead when provided.
        let out = reg
            .execute_with_fallback(
                "polymarket-clob",
                async { Ok::<_, anyhow::Error>(1) },
                || -1,
            )
            .await
            .unwrap();
        assert_eq!(out, -1);

        // After the cooldown the next successful call closes the breaker.
        tokio::time::advance(Duration::from_millis(60_001)).await;
        let out = reg
            .execute("polymarket-clob", async { Ok::<_, anyhow::Error>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        let status = reg.breaker_status("polymarket-clob");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let reg = registry(1, 30_000);

        let _ = reg
            .execute("llm", async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await;
        assert_eq!(reg.breaker_status("llm").state, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(30_001)).await;
        let _ = reg
            .execute("llm", async { Err::<(), _>(anyhow::anyhow!("still down")) })
            .await;
        assert_eq!(reg.breaker_status("llm").state, CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_open_and_reset() {
        let reg = registry(3, 60_000);
        reg.open_breaker("db");
        assert_eq!(reg.breaker_status("db").state, CircuitState::Open);

        reg.reset_breaker("db");
        let status = reg.breaker_status("db");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failures, 0);
    }

    #[tokio::test]
    async fn health_summary_aggregates() {
        let reg = registry(3, 60_000);
        assert_eq!(reg.health_summary().overall, OverallHealth::Healthy);

        // One recorded failure (below threshold) => DEGRADED.
        let _ = reg
            .execute("venue", async { Err::<(), _>(anyhow::anyhow!("x")) })
            .await;
        assert_eq!(reg.health_summary().overall, OverallHealth::Degraded);

        // An open breaker => CRITICAL.
        reg.open_breaker("venue");
        assert_eq!(reg.health_summary().overall, OverallHealth::Critical);
    }
}
