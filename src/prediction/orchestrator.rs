// =============================================================================
// Prediction Orchestrator — one bounded cycle plus background loops
// =============================================================================
//
// Cycle state machine:
//
//   INIT -> MARKET_DATA -> NEWS_CONTEXT -> THEORIZE -> BACKTEST ->
//   IDEA_SELECTED -> RISK_CHECKED -> (EXECUTED | SKIPPED_EXEC) -> LEARNED ->
//   IDLE | ERROR | EMERGENCY_STOP | NO_MARKETS
//
// Only the EXECUTED branch reaches the learner. Every transition pushes an
// AgentStatus record (kept in a capped ring) that includes the portfolio
// summary and market-intel coverage, failures included. The orchestrator
// owns the 30 s stop-loss loop and the 300 s reconciliation loop.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{Channel, MessageBus};
use crate::resilience::snapshot::{SnapshotService, SnapshotType};

use super::execution::{ExecutionOutcome, PredictionExecutionEngine};
use super::model::{
    AgentRunState, AgentStatus, CycleStep, Outcome, PredictionIdea, SignalAction, Trade,
    TradeSignal,
};
use super::nodes::{BacktesterNode, IdeaSelector, MarketDataNode, NewsContextNode, TheorizerNode};
use super::reconcile::PositionReconciler;
use super::risk::{RiskAssessment, RiskManager};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Record of one completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub final_step: CycleStep,
    pub executed_trade: Option<Trade>,
    pub risk_assessment: Option<RiskAssessment>,
    pub started_at: String,
    pub finished_at: String,
}

/// What the learner keeps per executed idea.
#[derive(Debug, Clone, Serialize)]
struct LearnedIdea {
    idea_id: String,
    market_id: String,
    edge: f64,
    confidence: f64,
    executed_at: String,
}

/// Statuses retained in the ring.
const MAX_STATUS_RECORDS: usize = 200;
/// Stop-loss sweep interval.
const STOP_LOSS_INTERVAL: Duration = Duration::from_secs(30);
/// Reconciliation interval.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct PredictionOrchestrator {
    market_data: MarketDataNode,
    news_context: NewsContextNode,
    theorizer: TheorizerNode,
    backtester: BacktesterNode,
    selector: IdeaSelector,
    risk: Arc<RiskManager>,
    engine: Arc<PredictionExecutionEngine>,
    reconciler: Arc<PositionReconciler>,
    snapshots: Arc<SnapshotService>,
    bus: Arc<MessageBus>,
    statuses: RwLock<Vec<AgentStatus>>,
    learned: RwLock<Vec<LearnedIdea>>,
}

impl PredictionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market_data: MarketDataNode,
        news_context: NewsContextNode,
        theorizer: TheorizerNode,
        backtester: BacktesterNode,
        selector: IdeaSelector,
        risk: Arc<RiskManager>,
        engine: Arc<PredictionExecutionEngine>,
        reconciler: Arc<PositionReconciler>,
        snapshots: Arc<SnapshotService>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            market_data,
            news_context,
            theorizer,
            backtester,
            selector,
            risk,
            engine,
            reconciler,
            snapshots,
            bus,
            statuses: RwLock::new(Vec::new()),
            learned: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) -> CycleRecord {
        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        self.push_status(&cycle_id, CycleStep::Init, AgentRunState::Running, None, None);

        // Sticky emergency stop ends the cycle before any stage runs.
        if self.risk.daily_state().emergency_stop_triggered {
            warn!(cycle_id = %cycle_id, "cycle aborted — emergency stop active");
            self.push_status(
                &cycle_id,
                CycleStep::EmergencyStop,
                AgentRunState::Error,
                Some("emergency stop active".into()),
                None,
            );
            return self.finish(cycle_id, CycleStep::EmergencyStop, None, None, started_at);
        }

        // ── MARKET_DATA ─────────────────────────────────────────────────
        self.push_status(&cycle_id, CycleStep::MarketData, AgentRunState::Running, None, None);
        let markets = match self.market_data.fetch().await {
            Ok(m) => m,
            Err(e) => {
                warn!(cycle_id = %cycle_id, error = %e, "market data stage failed");
                self.bus.publish(
                    Channel::Error,
                    serde_json::json!({
                        "agent": "prediction-agent",
                        "cycle_id": cycle_id,
                        "stage": "MARKET_DATA",
                        "error": e.to_string(),
                    }),
                );
                self.push_status(
                    &cycle_id,
                    CycleStep::Error,
                    AgentRunState::Error,
                    Some(e.to_string()),
                    None,
                );
                return self.finish(cycle_id, CycleStep::Error, None, None, started_at);
            }
        };
        if markets.is_empty() {
            self.push_status(&cycle_id, CycleStep::NoMarkets, AgentRunState::Idle, None, None);
            return self.finish(cycle_id, CycleStep::NoMarkets, None, None, started_at);
        }

        // ── NEWS_CONTEXT ────────────────────────────────────────────────
        let context = match self.news_context.build(&markets).await {
            Ok(c) => c,
            Err(e) => {
                // Missing news context degrades the cycle, never aborts it.
                warn!(cycle_id = %cycle_id, error = %e, "news context unavailable");
                Default::default()
            }
        };
        let coverage = (context.market_intel.len() as u32, markets.len() as u32);
        self.push_status(
            &cycle_id,
            CycleStep::NewsContext,
            AgentRunState::Running,
            None,
            Some(coverage),
        );

        // ── THEORIZE ────────────────────────────────────────────────────
        let ideas = self.theorizer.theorize(&markets, &context);
        self.push_status(
            &cycle_id,
            CycleStep::Theorize,
            AgentRunState::Running,
            Some(format!("{} ideas", ideas.len())),
            Some(coverage),
        );
        if ideas.is_empty() {
            return self.idle(cycle_id, started_at, coverage);
        }

        // ── BACKTEST ────────────────────────────────────────────────────
        let backtested = self.backtester.backtest(ideas, &self.engine.trades());
        self.push_status(
            &cycle_id,
            CycleStep::Backtest,
            AgentRunState::Running,
            Some(format!("{} ideas survived", backtested.len())),
            Some(coverage),
        );
        let surviving: Vec<PredictionIdea> =
            backtested.into_iter().map(|(idea, _)| idea).collect();
        if surviving.is_empty() {
            return self.idle(cycle_id, started_at, coverage);
        }

        // ── IDEA_SELECTED ───────────────────────────────────────────────
        let idea = match self.selector.select(&surviving) {
            Some(idea) => idea,
            None => return self.idle(cycle_id, started_at, coverage),
        };
        self.push_status(
            &cycle_id,
            CycleStep::IdeaSelected,
            AgentRunState::Running,
            Some(format!(
                "{} {} edge {:.3} conf {:.2}",
                idea.market_id, idea.outcome, idea.edge, idea.confidence
            )),
            Some(coverage),
        );

        // ── RISK_CHECKED ────────────────────────────────────────────────
        let portfolio = self.engine.portfolio();
        let assessment = self.risk.assess_trade(
            &idea,
            portfolio.total_value,
            portfolio.available_balance,
            &self.engine.positions(),
        );
        self.push_status(
            &cycle_id,
            CycleStep::RiskChecked,
            AgentRunState::Running,
            Some(
                serde_json::to_string(&assessment)
                    .unwrap_or_else(|_| "unserializable assessment".into()),
            ),
            Some(coverage),
        );

        if !assessment.approved {
            info!(
                cycle_id = %cycle_id,
                warnings = ?assessment.warnings,
                "trade skipped by risk gate"
            );
            self.push_status(
                &cycle_id,
                CycleStep::SkippedExec,
                AgentRunState::Idle,
                Some(assessment.warnings.join("; ")),
                Some(coverage),
            );
            return self.finish(
                cycle_id,
                CycleStep::SkippedExec,
                None,
                Some(assessment),
                started_at,
            );
        }

        // ── EXECUTED | SKIPPED_EXEC ─────────────────────────────────────
        let price = match idea.outcome {
            Outcome::Yes => markets
                .iter()
                .find(|m| m.market_id == idea.market_id)
                .map(|m| m.last_yes_price),
            Outcome::No => markets
                .iter()
                .find(|m| m.market_id == idea.market_id)
                .map(|m| m.last_no_price),
        }
        .unwrap_or(0.0);

        let signal = TradeSignal {
            market_id: idea.market_id.clone(),
            outcome: idea.outcome,
            action: SignalAction::Buy,
            price,
            rationale: idea.rationale.clone(),
        };

        let outcome = self
            .engine
            .execute_signal(&signal, &assessment, &idea.market_title)
            .await;

        let (final_step, trade) = match outcome {
            ExecutionOutcome::Executed(trade) => {
                self.push_status(
                    &cycle_id,
                    CycleStep::Executed,
                    AgentRunState::Running,
                    Some(format!("trade {}", trade.trade_id)),
                    Some(coverage),
                );

                // Per-entity history for the traded market.
                for position in self.engine.positions() {
                    if position.market_id == trade.market_id {
                        self.snapshots.snapshot_position(&position);
                    }
                }

                // ── LEARNED (executed branch only) ──────────────────────
                self.learned.write().push(LearnedIdea {
                    idea_id: idea.id.clone(),
                    market_id: idea.market_id.clone(),
                    edge: idea.edge,
                    confidence: idea.confidence,
                    executed_at: trade.executed_at.clone(),
                });
                self.push_status(
                    &cycle_id,
                    CycleStep::Learned,
                    AgentRunState::Running,
                    None,
                    Some(coverage),
                );
                (CycleStep::Idle, Some(trade))
            }
            ExecutionOutcome::Rejected(reason) => {
                self.push_status(
                    &cycle_id,
                    CycleStep::SkippedExec,
                    AgentRunState::Idle,
                    Some(reason),
                    Some(coverage),
                );
                (CycleStep::SkippedExec, None)
            }
        };

        self.snapshots.create_snapshot(
            SnapshotType::CycleComplete,
            Some(cycle_id.clone()),
            None,
        );
        self.finish(cycle_id, final_step, trade, Some(assessment), started_at)
    }

    fn idle(&self, cycle_id: String, started_at: String, coverage: (u32, u32)) -> CycleRecord {
        self.push_status(&cycle_id, CycleStep::Idle, AgentRunState::Idle, None, Some(coverage));
        self.finish(cycle_id, CycleStep::Idle, None, None, started_at)
    }

    fn finish(
        &self,
        cycle_id: String,
        final_step: CycleStep,
        executed_trade: Option<Trade>,
        risk_assessment: Option<RiskAssessment>,
        started_at: String,
    ) -> CycleRecord {
        info!(cycle_id = %cycle_id, final_step = %final_step, "prediction cycle finished");
        CycleRecord {
            cycle_id,
            final_step,
            executed_trade,
            risk_assessment,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        }
    }

    // -------------------------------------------------------------------------
    // Status records
    // -------------------------------------------------------------------------

    fn push_status(
        &self,
        cycle_id: &str,
        step: CycleStep,
        state: AgentRunState,
        detail: Option<String>,
        coverage: Option<(u32, u32)>,
    ) {
        let record = AgentStatus {
            agent: "prediction-agent".to_string(),
            status: state,
            current_step: step,
            cycle_id: cycle_id.to_string(),
            detail,
            portfolio: Some(self.engine.portfolio()),
            market_intel_coverage: coverage,
            at: Utc::now().to_rfc3339(),
        };

        let mut statuses = self.statuses.write();
        statuses.push(record);
        while statuses.len() > MAX_STATUS_RECORDS {
            statuses.remove(0);
        }
    }

    /// Recent status records, oldest first.
    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.statuses.read().clone()
    }

    /// Most recent status.
    pub fn current_status(&self) -> Option<AgentStatus> {
        self.statuses.read().last().cloned()
    }

    // -------------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------------

    /// Spawn the stop-loss sweep (30 s) and reconciliation (300 s) loops.
    pub fn spawn_background_loops(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let orchestrator = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STOP_LOSS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.sweep_stop_losses().await;
            }
        }));

        handles.push(self.reconciler.clone().spawn_loop(RECONCILE_INTERVAL));
        handles.push(self.engine.spawn_pending_monitor());
        handles
    }

    /// Close out every position past its stop. Exits bypass the pre-trade
    /// gates (they reduce risk, never add it).
    pub async fn sweep_stop_losses(&self) {
        for hit in self.engine.check_stop_losses() {
            warn!(market_id = %hit.market_id, reason = %hit.reason, "stop loss triggered");
            self.bus.publish(
                Channel::StopLossTriggered,
                serde_json::json!({
                    "market_id": hit.market_id,
                    "shares": hit.shares,
                    "entry_price": hit.entry_price,
                    "current_price": hit.current_price,
                    "pnl_pct": hit.pnl_pct,
                    "reason": hit.reason,
                }),
            );

            let signal = TradeSignal {
                market_id: hit.market_id.clone(),
                outcome: hit.outcome,
                action: SignalAction::Sell,
                price: hit.current_price,
                rationale: hit.reason.clone(),
            };
            let assessment = RiskAssessment {
                approved: true,
                suggested_size_usd: hit.shares * hit.current_price,
                risk_score: 1.0,
                max_loss_usd: 0.0,
                warnings: vec!["stop-loss exit".into()],
            };
            match self.engine.execute_signal(&signal, &assessment, "").await {
                ExecutionOutcome::Executed(trade) => {
                    info!(trade_id = %trade.trade_id, pnl = trade.pnl, "stop-loss exit filled");
                }
                ExecutionOutcome::Rejected(reason) => {
                    warn!(market_id = %hit.market_id, reason = %reason, "stop-loss exit rejected");
                }
            }
        }
    }
}

impl std::fmt::Debug for PredictionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionOrchestrator")
            .field("statuses", &self.statuses.read().len())
            .field("learned", &self.learned.read().len())
            .finish()
    }
}
