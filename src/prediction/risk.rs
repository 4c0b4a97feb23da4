// =============================================================================
// Risk Manager — pre-trade gates protecting capital
// =============================================================================
//
// Ordered checks on every trade idea (first failure rejects):
//   1. Emergency stop        — sticky flag, admin reset only
//   2. Daily loss            — min(pct of portfolio, USD cap); breach of the
//                              larger emergency threshold trips the stop
//   3. Daily trade count
//   4. Cooldown              — post-loss / post-win timers
//   5. Portfolio heat        — open notional / portfolio value
//   6. Max positions
//   7. Correlation           — same market, or too many title-overlapping
//                              positions
//   8. Position sizing       — confidence/edge/heat-scaled, floored
//
// Daily counters reset when the local date rolls over; the state is persisted
// on every mutation. All mutating entry points serialize through one lock.
// =============================================================================

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{Duration, Local, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::model::{DailyRiskState, PredictionIdea, PredictionPosition, Trade};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Configuration limits, loaded from the runtime config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_daily_loss_pct: f64,
    pub max_daily_loss_usd: f64,
    pub max_daily_trades: u32,
    pub max_portfolio_heat_pct: f64,
    pub max_positions: usize,
    pub max_position_pct: f64,
    pub cooldown_after_loss_minutes: i64,
    pub cooldown_after_win_minutes: i64,
    pub stop_loss_pct: f64,
    pub enable_correlation_check: bool,
    pub max_correlated_positions: usize,
    pub max_slippage_pct: f64,
    pub min_market_volume: f64,
    pub max_market_age_days: i64,
    /// Fraction of portfolio value whose loss trips the emergency stop.
    pub emergency_stop_daily_loss: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.02,
            max_daily_loss_usd: 100.0,
            max_daily_trades: 5,
            max_portfolio_heat_pct: 0.30,
            max_positions: 10,
            max_position_pct: 0.05,
            cooldown_after_loss_minutes: 30,
            cooldown_after_win_minutes: 5,
            stop_loss_pct: 0.20,
            enable_correlation_check: true,
            max_correlated_positions: 2,
            max_slippage_pct: 0.02,
            min_market_volume: 1_000.0,
            max_market_age_days: 90,
            emergency_stop_daily_loss: 0.05,
        }
    }
}

// ---------------------------------------------------------------------------
// Assessment result
// ---------------------------------------------------------------------------

/// Outcome of one pre-trade assessment. A rejected assessment always carries
/// `suggested_size_usd == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub approved: bool,
    pub suggested_size_usd: f64,
    /// In [0, 1]; higher is riskier.
    pub risk_score: f64,
    pub max_loss_usd: f64,
    pub warnings: Vec<String>,
}

/// One stop-loss hit from a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct StopLossHit {
    pub market_id: String,
    pub outcome: super::model::Outcome,
    pub shares: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub pnl_pct: f64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Persistence seam
// ---------------------------------------------------------------------------

/// Where daily risk state rows live. Keyed by ISO date.
pub trait DailyStateStore: Send + Sync {
    fn load(&self, date: &str) -> Option<DailyRiskState>;
    fn save(&self, state: &DailyRiskState) -> anyhow::Result<()>;
}

/// JSON-file store using the atomic tmp + rename pattern.
pub struct JsonDailyStateStore {
    path: PathBuf,
}

impl JsonDailyStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DailyStateStore for JsonDailyStateStore {
    fn load(&self, date: &str) -> Option<DailyRiskState> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let state: DailyRiskState = serde_json::from_str(&content).ok()?;
        (state.date == date).then_some(state)
    }

    fn save(&self, state: &DailyRiskState) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store for paper mode and tests.
#[derive(Default)]
pub struct MemoryDailyStateStore {
    state: RwLock<Option<DailyRiskState>>,
}

impl DailyStateStore for MemoryDailyStateStore {
    fn load(&self, date: &str) -> Option<DailyRiskState> {
        self.state.read().clone().filter(|s| s.date == date)
    }

    fn save(&self, state: &DailyRiskState) -> anyhow::Result<()> {
        *self.state.write() = Some(state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Minimum position floor in USD.
const MIN_POSITION_USD: f64 = 5.0;

pub struct RiskManager {
    limits: RiskLimits,
    state: RwLock<DailyRiskState>,
    store: Box<dyn DailyStateStore>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, store: Box<dyn DailyStateStore>) -> Self {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let state = store
            .load(&today)
            .unwrap_or_else(|| DailyRiskState::new_for(today.clone()));
        info!(
            date = %state.date,
            trades = state.trades,
            daily_pnl = state.daily_pnl,
            emergency_stop = state.emergency_stop_triggered,
            "RiskManager initialised"
        );
        Self {
            limits,
            state: RwLock::new(state),
            store,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    // -------------------------------------------------------------------------
    // Pre-trade assessment
    // -------------------------------------------------------------------------

    /// Run every gate in order. Mutating (the emergency stop can trip here),
    /// so it takes the state write lock for the whole assessment.
    pub fn assess_trade(
        &self,
        idea: &PredictionIdea,
        portfolio_value: f64,
        available_balance: f64,
        positions: &[PredictionPosition],
    ) -> RiskAssessment {
        self.maybe_reset_daily();
        let mut state = self.state.write();
        let mut warnings: Vec<String> = Vec::new();

        // ── 1. Emergency stop ───────────────────────────────────────────
        if state.emergency_stop_triggered {
            warn!(market_id = %idea.market_id, "trade rejected — emergency stop active");
            return Self::rejected(vec!["Emergency stop active".to_string()]);
        }

        // ── 2. Daily loss ───────────────────────────────────────────────
        let loss = (-state.daily_pnl).max(0.0);
        let daily_loss_cap = (portfolio_value * self.limits.max_daily_loss_pct)
            .min(self.limits.max_daily_loss_usd);
        if loss > portfolio_value * self.limits.emergency_stop_daily_loss {
            state.emergency_stop_triggered = true;
            self.persist(&state);
            warn!(
                daily_pnl = state.daily_pnl,
                "emergency stop triggered by daily loss"
            );
            return Self::rejected(vec![
                "Daily loss limit reached".to_string(),
                "Emergency stop triggered".to_string(),
            ]);
        }
        if loss > daily_loss_cap {
            warnings.push("Daily loss limit reached".to_string());
            return Self::rejected(warnings);
        }

        // ── 3. Daily trade count ────────────────────────────────────────
        if state.trades >= self.limits.max_daily_trades {
            warnings.push(format!(
                "Daily trade limit reached ({}/{})",
                state.trades, self.limits.max_daily_trades
            ));
            return Self::rejected(warnings);
        }

        // ── 4. Cooldown ─────────────────────────────────────────────────
        if let Some(until) = state.cooldown_until {
            let now = Utc::now();
            if now < until {
                warnings.push(format!(
                    "Cooldown active for another {}s",
                    (until - now).num_seconds()
                ));
                return Self::rejected(warnings);
            }
        }

        // ── 5. Portfolio heat ───────────────────────────────────────────
        let open_notional: f64 = positions.iter().map(|p| p.shares * p.last_price).sum();
        let heat = if portfolio_value > 0.0 {
            open_notional / portfolio_value
        } else {
            0.0
        };
        if heat >= self.limits.max_portfolio_heat_pct {
            warnings.push(format!(
                "Portfolio heat {:.1}% at limit {:.1}%",
                heat * 100.0,
                self.limits.max_portfolio_heat_pct * 100.0
            ));
            return Self::rejected(warnings);
        }

        // ── 6. Max positions ────────────────────────────────────────────
        if positions.len() >= self.limits.max_positions {
            warnings.push(format!(
                "Position limit reached ({}/{})",
                positions.len(),
                self.limits.max_positions
            ));
            return Self::rejected(warnings);
        }

        // ── 7. Correlation ──────────────────────────────────────────────
        if self.limits.enable_correlation_check {
            if positions.iter().any(|p| p.market_id == idea.market_id) {
                warnings.push(format!("Already positioned in market {}", idea.market_id));
                return Self::rejected(warnings);
            }
            let correlated = positions
                .iter()
                .filter(|p| shared_long_words(&p.market_title, &idea.market_title) >= 2)
                .count();
            if correlated >= self.limits.max_correlated_positions {
                warnings.push(format!(
                    "Too many correlated positions ({correlated})"
                ));
                return Self::rejected(warnings);
            }
        }

        // ── 8. Position sizing ──────────────────────────────────────────
        let heat_remaining = (self.limits.max_portfolio_heat_pct - heat).max(0.0);
        let heat_factor = (heat_remaining / self.limits.max_portfolio_heat_pct).max(0.3);
        let confidence_factor = 0.5 + 0.5 * idea.confidence;
        let edge_factor = (1.0 + 2.0 * idea.edge.abs()).min(1.5);

        let mut size = portfolio_value
            * self.limits.max_position_pct
            * confidence_factor
            * edge_factor
            * heat_factor;
        size = size.min(available_balance);

        let floor = MIN_POSITION_USD.max(available_balance * 0.01);
        if size < floor {
            warnings.push(format!(
                "Computed size ${size:.2} below floor ${floor:.2}"
            ));
            return Self::rejected(warnings);
        }
        size = (size * 100.0).round() / 100.0;

        let risk_score = ((idea.edge - 0.1).abs() * 2.0).min(0.3)
            + (1.0 - idea.confidence) * 0.3
            + (positions.len() as f64 / self.limits.max_positions as f64) * 0.2;
        let risk_score = risk_score.clamp(0.0, 1.0);

        debug!(
            market_id = %idea.market_id,
            size,
            risk_score,
            heat = heat * 100.0,
            "trade approved"
        );

        RiskAssessment {
            approved: true,
            suggested_size_usd: size,
            risk_score,
            max_loss_usd: size * self.limits.stop_loss_pct,
            warnings,
        }
    }

    fn rejected(warnings: Vec<String>) -> RiskAssessment {
        RiskAssessment {
            approved: false,
            suggested_size_usd: 0.0,
            risk_score: 1.0,
            max_loss_usd: 0.0,
            warnings,
        }
    }

    // -------------------------------------------------------------------------
    // Stop losses
    // -------------------------------------------------------------------------

    /// Every position whose drawdown from entry exceeds the stop threshold.
    pub fn check_stop_losses(&self, positions: &[PredictionPosition]) -> Vec<StopLossHit> {
        positions
            .iter()
            .filter_map(|p| {
                if p.average_price <= 0.0 {
                    return None;
                }
                let pnl_pct = (p.last_price - p.average_price) / p.average_price;
                if pnl_pct < -self.limits.stop_loss_pct {
                    Some(StopLossHit {
                        market_id: p.market_id.clone(),
                        outcome: p.outcome,
                        shares: p.shares,
                        entry_price: p.average_price,
                        current_price: p.last_price,
                        pnl_pct,
                        reason: format!(
                            "Stop loss: {} down {:.1}% from entry {:.3} to {:.3}",
                            p.market_id,
                            -pnl_pct * 100.0,
                            p.average_price,
                            p.last_price
                        ),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record an executed trade: daily stats, post-trade cooldown, persist,
    /// and emergency-stop re-check against `portfolio_value`.
    pub fn record_trade(&self, trade: &Trade, portfolio_value: f64) {
        self.maybe_reset_daily();
        let mut state = self.state.write();

        state.trades += 1;
        state.total_trades += 1;
        state.daily_pnl += trade.pnl;
        state.last_trade_time = Some(trade.executed_at.clone());

        let cooldown_minutes = if trade.pnl < 0.0 {
            state.losing_trades += 1;
            self.limits.cooldown_after_loss_minutes
        } else {
            state.winning_trades += 1;
            self.limits.cooldown_after_win_minutes
        };
        state.cooldown_until = Some(Utc::now() + Duration::minutes(cooldown_minutes));

        if -state.daily_pnl > portfolio_value * self.limits.emergency_stop_daily_loss {
            state.emergency_stop_triggered = true;
            warn!(daily_pnl = state.daily_pnl, "emergency stop triggered after trade");
        }

        self.persist(&state);
        info!(
            trade_id = %trade.trade_id,
            pnl = trade.pnl,
            daily_pnl = state.daily_pnl,
            trades_today = state.trades,
            cooldown_minutes,
            "trade recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Admin controls
    // -------------------------------------------------------------------------

    /// Trip the emergency stop manually.
    pub fn trigger_emergency_stop(&self, reason: &str) {
        let mut state = self.state.write();
        state.emergency_stop_triggered = true;
        self.persist(&state);
        warn!(reason, "emergency stop triggered manually");
    }

    /// Clear the emergency stop. The only path that clears it.
    pub fn reset_emergency_stop(&self) {
        let mut state = self.state.write();
        state.emergency_stop_triggered = false;
        self.persist(&state);
        info!("emergency stop reset (admin)");
    }

    /// Start a cooldown immediately.
    pub fn force_cooldown(&self, minutes: i64) {
        let mut state = self.state.write();
        state.cooldown_until = Some(Utc::now() + Duration::minutes(minutes));
        self.persist(&state);
        info!(minutes, "cooldown forced");
    }

    /// Snapshot of the current daily state.
    pub fn daily_state(&self) -> DailyRiskState {
        self.maybe_reset_daily();
        self.state.read().clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Reset counters when the local date has rolled over. The emergency
    /// stop survives the reset.
    fn maybe_reset_daily(&self) {
        let today = Local::now().format("%Y-%m-%d").to_string();
        {
            let state = self.state.read();
            if state.date == today {
                return;
            }
        }
        let mut state = self.state.write();
        // Double-check under the write lock.
        if state.date != today {
            info!(old_date = %state.date, new_date = %today, "daily risk counters reset");
            let total_trades = state.total_trades;
            let emergency = state.emergency_stop_triggered;
            *state = DailyRiskState::new_for(today);
            state.total_trades = total_trades;
            state.emergency_stop_triggered = emergency;
            self.persist(&state);
        }
    }

    fn persist(&self, state: &DailyRiskState) {
        if let Err(e) = self.store.save(state) {
            warn!(error = %e, "failed to persist daily risk state");
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("limits", &self.limits)
            .field("date", &self.state.read().date)
            .finish()
    }
}

/// Count words longer than 3 chars shared by two strings (correlation
/// heuristic over market titles).
fn shared_long_words(a: &str, b: &str) -> usize {
    let set_a: HashSet<String> = a
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(String::from)
        .collect();
    b.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .collect::<HashSet<&str>>()
        .iter()
        .filter(|w| set_a.contains(**w))
        .count()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::model::Outcome;

    fn idea(edge: f64, confidence: f64) -> PredictionIdea {
        PredictionIdea {
            id: "i-1".into(),
            market_id: "mkt-new".into(),
            market_title: "Will the Fed cut interest rates in September".into(),
            outcome: Outcome::Yes,
            edge,
            confidence,
            rationale: "strong news heat".into(),
            heat_score: 50.0,
            sentiment_score: 0.4,
            linked_news_count: 5,
            linked_cluster_count: 2,
            time_horizon: "24h".into(),
        }
    }

    fn position(market_id: &str, shares: f64, avg: f64, last: f64) -> PredictionPosition {
        PredictionPosition {
            market_id: market_id.into(),
            market_title: format!("Market {market_id}"),
            outcome: Outcome::Yes,
            shares,
            average_price: avg,
            last_price: last,
            unrealized_pnl: (last - avg) * shares,
            opened_at: Utc::now().to_rfc3339(),
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskLimits::default(), Box::new(MemoryDailyStateStore::default()))
    }

    fn trade(pnl: f64) -> Trade {
        Trade {
            trade_id: "t-1".into(),
            market_id: "mkt-1".into(),
            outcome: Outcome::Yes,
            side: super::super::model::OrderSide::Sell,
            shares: 10.0,
            price: 0.5,
            fee: 0.01,
            pnl,
            reason: "test".into(),
            executed_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn sizing_formula_with_high_heat() {
        let manager = manager();
        // Portfolio $10,000, heat 29 % (2,900 notional), edge 0.12, conf 0.8.
        let positions = vec![position("mkt-old", 5_800.0, 0.5, 0.5)];
        let assessment = manager.assess_trade(&idea(0.12, 0.8), 10_000.0, 7_100.0, &positions);

        assert!(assessment.approved, "{:?}", assessment.warnings);
        // 10000 * 0.05 * 0.9 * 1.24 * 0.3 = 167.40
        assert!((assessment.suggested_size_usd - 167.40).abs() < 0.01);
        assert!(assessment.max_loss_usd > 0.0);
        // risk score: min(0.04, 0.3) + 0.06 + (1/10)*0.2 = 0.12
        assert!((assessment.risk_score - 0.12).abs() < 1e-9);
    }

    #[test]
    fn daily_loss_limit_rejects_with_zero_size() {
        let manager = manager();
        manager.record_trade(&trade(-101.0), 10_000.0);
        // Clear the post-trade cooldown so the loss gate is what fires.
        manager.state.write().cooldown_until = None;

        let assessment = manager.assess_trade(&idea(0.12, 0.8), 10_000.0, 9_899.0, &[]);
        assert!(!assessment.approved);
        assert!((assessment.suggested_size_usd - 0.0).abs() < f64::EPSILON);
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.contains("Daily loss limit reached")));
    }

    #[test]
    fn emergency_stop_trips_at_portfolio_fraction() {
        let manager = manager();
        // 5 % of $10,000 = $500; lose more than that.
        manager.record_trade(&trade(-501.0), 10_000.0);
        assert!(manager.daily_state().emergency_stop_triggered);

        // Sticky: every subsequent assessment is rejected.
        let assessment = manager.assess_trade(&idea(0.2, 0.9), 10_000.0, 9_000.0, &[]);
        assert!(!assessment.approved);
        assert!(assessment.warnings.iter().any(|w| w.contains("Emergency stop")));

        // Only the admin reset clears it.
        manager.reset_emergency_stop();
        assert!(!manager.daily_state().emergency_stop_triggered);
    }

    #[test]
    fn trade_count_gate() {
        let manager = manager();
        for _ in 0..5 {
            manager.record_trade(&trade(1.0), 10_000.0);
        }
        manager.state.write().cooldown_until = None;

        let assessment = manager.assess_trade(&idea(0.1, 0.8), 10_000.0, 9_000.0, &[]);
        assert!(!assessment.approved);
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.contains("Daily trade limit")));
    }

    #[test]
    fn cooldown_gate_after_win_and_loss() {
        let manager = manager();
        manager.record_trade(&trade(5.0), 10_000.0);
        let assessment = manager.assess_trade(&idea(0.1, 0.8), 10_000.0, 9_000.0, &[]);
        assert!(!assessment.approved);
        assert!(assessment.warnings.iter().any(|w| w.contains("Cooldown")));

        // A loss sets the longer cooldown.
        let state = manager.daily_state();
        assert!(state.cooldown_until.is_some());
    }

    #[test]
    fn portfolio_heat_gate() {
        let manager = manager();
        // Heat 30 %: 3,000 notional on $10,000.
        let positions = vec![position("mkt-old", 6_000.0, 0.5, 0.5)];
        let assessment = manager.assess_trade(&idea(0.1, 0.8), 10_000.0, 7_000.0, &positions);
        assert!(!assessment.approved);
        assert!(assessment.warnings.iter().any(|w| w.contains("heat")));
    }

    #[test]
    fn same_market_correlation_gate() {
        let manager = manager();
        let positions = vec![position("mkt-new", 10.0, 0.5, 0.5)];
        let assessment = manager.assess_trade(&idea(0.1, 0.8), 10_000.0, 9_000.0, &positions);
        assert!(!assessment.approved);
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.contains("Already positioned")));
    }

    #[test]
    fn title_correlation_gate() {
        let manager = manager();
        let mut p1 = position("mkt-a", 10.0, 0.5, 0.5);
        p1.market_title = "Will the Fed cut rates by June".into();
        let mut p2 = position("mkt-b", 10.0, 0.5, 0.5);
        p2.market_title = "Fed rates decision before the election".into();

        // Both positions share >= 2 long (>3 char) words with the idea title.
        let mut target = idea(0.1, 0.8);
        target.market_title = "Will rates decision follow the election".into();

        let assessment = manager.assess_trade(&target, 10_000.0, 9_000.0, &[p1, p2]);
        assert!(!assessment.approved);
        assert!(assessment.warnings.iter().any(|w| w.contains("correlated")));
    }

    #[test]
    fn max_positions_gate() {
        let manager = manager();
        let positions: Vec<PredictionPosition> = (0..10)
            .map(|i| position(&format!("mkt-{i}"), 1.0, 0.5, 0.5))
            .collect();
        let assessment = manager.assess_trade(&idea(0.1, 0.8), 10_000.0, 9_000.0, &positions);
        assert!(!assessment.approved);
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.contains("Position limit")));
    }

    #[test]
    fn stop_loss_sweep_on_25pct_drawdown() {
        let manager = manager();
        // 100 shares at 0.40, now 0.30: -25 % < -20 % threshold.
        let positions = vec![position("mkt-1", 100.0, 0.40, 0.30)];
        let hits = manager.check_stop_losses(&positions);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].pnl_pct + 0.25).abs() < 1e-9);
        // Realized loss would be (0.30 - 0.40) * 100 = -$10.
        assert!(((hits[0].current_price - hits[0].entry_price) * hits[0].shares + 10.0).abs() < 1e-9);

        // A 15 % drawdown does not trigger.
        let safe = vec![position("mkt-2", 100.0, 0.40, 0.34)];
        assert!(manager.check_stop_losses(&safe).is_empty());
    }

    #[test]
    fn rejected_assessments_never_size_positions() {
        let manager = manager();
        manager.trigger_emergency_stop("test");
        let assessment = manager.assess_trade(&idea(0.5, 1.0), 10_000.0, 10_000.0, &[]);
        assert!(!assessment.approved);
        assert_eq!(assessment.suggested_size_usd, 0.0);
    }

    #[test]
    fn size_floor_rejects_dust() {
        let manager = manager();
        // Tiny portfolio: computed size under the $5 floor.
        let assessment = manager.assess_trade(&idea(0.05, 0.5), 50.0, 50.0, &[]);
        assert!(!assessment.approved);
        assert!(assessment.warnings.iter().any(|w| w.contains("floor")));
    }
}
