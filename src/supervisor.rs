// =============================================================================
// Supervisor — spawn, watch, and restart the two agents
// =============================================================================
//
// Each agent runs as a supervised tokio task. When an agent's task exits or
// panics, the supervisor restarts it with exponential backoff: 5 s, doubling
// to a 60 s cap. A run that stays alive through the healthy window resets the
// backoff. A panic in the prediction agent additionally fires the best-effort
// emergency close-all hook before the restart.
// =============================================================================

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::bus::Channel;
use crate::types::{AgentKind, EngineMode};

/// First restart delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
/// Restart delay cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// A run alive this long resets the backoff.
const HEALTHY_WINDOW: Duration = Duration::from_secs(300);
/// Prediction cycle pacing.
const PREDICTION_CYCLE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Supervisor {
    state: Arc<AppState>,
}

impl Supervisor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Spawn both supervised agents plus their background loops. Returns the
    /// supervision handles (abort on shutdown).
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.supervise(AgentKind::News));
        handles.push(self.supervise(AgentKind::Prediction));
        handles.extend(self.state.prediction.spawn_background_loops());
        handles
    }

    /// Supervision loop for one agent: run, observe exit, back off, restart.
    fn supervise(&self, agent: AgentKind) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                info!(agent = %agent, "starting agent");
                let started = Instant::now();

                let run_state = Arc::clone(&state);
                let handle = tokio::spawn(async move {
                    match agent {
                        AgentKind::News => run_news_agent(run_state).await,
                        AgentKind::Prediction => run_prediction_agent(run_state).await,
                    }
                });

                match handle.await {
                    Ok(()) => {
                        warn!(agent = %agent, "agent loop exited");
                    }
                    Err(e) if e.is_panic() => {
                        error!(agent = %agent, "agent PANICKED");
                        state.push_error(format!("{agent} panicked"), None);
                        state.bus.publish(
                            Channel::Error,
                            serde_json::json!({ "agent": agent.to_string(), "panic": true }),
                        );
                        if agent == AgentKind::Prediction {
                            // Best-effort: never leave positions unmanaged.
                            let report = state.engine.emergency_close_all();
                            state.bus.publish(
                                Channel::EmergencyStop,
                                serde_json::json!({
                                    "source": "supervisor-panic-hook",
                                    "closed": report.closed,
                                    "failed": report.failed,
                                    "total_pnl": report.total_pnl,
                                }),
                            );
                        }
                    }
                    Err(_) => {
                        // Cancelled: the supervisor itself is shutting down.
                        info!(agent = %agent, "agent cancelled — supervision ending");
                        return;
                    }
                }

                // Healthy long run resets the backoff; quick death doubles it.
                if started.elapsed() >= HEALTHY_WINDOW {
                    backoff = BACKOFF_INITIAL;
                } else {
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }

                warn!(
                    agent = %agent,
                    restart_in_s = backoff.as_secs(),
                    "restarting agent after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        })
    }
}

/// News agent loop: one clustering cycle per configured interval while the
/// engine is Running.
async fn run_news_agent(state: Arc<AppState>) {
    let interval_ms = state.runtime_config.read().news_cycle_interval_ms;
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1_000)));
    info!(interval_ms, "news agent loop started");

    loop {
        ticker.tick().await;
        if state.runtime_config.read().engine_mode != EngineMode::Running {
            continue;
        }
        let outcome = state.news.run_cycle().await;
        state.increment_version();
        if outcome.stats.clustered > 0 || outcome.stats.anomalies > 0 {
            state.bus.publish(
                Channel::Info,
                serde_json::json!({
                    "agent": "news-agent",
                    "cycle_id": outcome.cycle_id,
                    "step": outcome.step.to_string(),
                    "clustered": outcome.stats.clustered,
                    "anomalies": outcome.stats.anomalies,
                }),
            );
        }
    }
}

/// Prediction agent loop: one trading cycle per minute while Running.
async fn run_prediction_agent(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(PREDICTION_CYCLE_INTERVAL);
    info!("prediction agent loop started");

    loop {
        ticker.tick().await;
        if state.runtime_config.read().engine_mode != EngineMode::Running {
            continue;
        }
        let record = state.prediction.run_cycle().await;
        state.increment_version();
        if let Some(trade) = &record.executed_trade {
            info!(
                cycle_id = %record.cycle_id,
                trade_id = %trade.trade_id,
                "prediction cycle executed a trade"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;

    #[tokio::test]
    async fn supervisor_spawns_and_aborts_cleanly() {
        let state = Arc::new(AppState::new(RuntimeConfig::default()).unwrap());
        let supervisor = Supervisor::new(state);
        let handles = supervisor.start();
        assert!(!handles.is_empty());
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paused_engine_skips_cycles() {
        // Paused mode: agents tick but never run cycles; nothing panics and
        // no state changes beyond the version counter's initial value.
        let state = Arc::new(AppState::new(RuntimeConfig::default()).unwrap());
        let version_before = state.current_state_version();

        let run_state = Arc::clone(&state);
        let handle = tokio::spawn(async move { run_prediction_agent(run_state).await });
        tokio::time::advance(Duration::from_secs(121)).await;
        // Let the spawned loop observe the ticks.
        tokio::task::yield_now().await;
        handle.abort();

        assert_eq!(state.current_state_version(), version_before);
    }
}
