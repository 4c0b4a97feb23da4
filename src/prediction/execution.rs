// =============================================================================
// Prediction Execution Engine — order lifecycle on binary outcome markets
// =============================================================================
//
// Owns all trading state: cash, realized PnL, positions keyed by
// (market_id, outcome), the price cache, pending orders, and the order book
// kept for snapshots and overfill protection. External readers get copies
// through `portfolio()` / `positions()` / `pending_orders()`.
//
// Execution path: validate (HOLD / price / risk / size / staleness) ->
// one-pending-per-market gate -> pending order -> trade mechanics with
// balance and (live) slippage gates -> trade persisted, risk notified, bus
// event published. Failures mark the pending order FAILED; a GC removes
// terminal pending orders after 60 s, and a 10 s monitor cancels PENDING
// orders older than the timeout.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Channel, MessageBus};
use crate::resilience::overfill::OverfillProtection;
use crate::resilience::snapshot::{Snapshot, SnapshotSource};
use crate::types::AccountMode;

use super::model::{
    OrderSide, OrderState, OrderStatus, Outcome, PendingOrderStatus, Portfolio, PredictionPosition,
    SignalAction, Trade, TradeSignal, SHARE_EPSILON,
};
use super::risk::{RiskAssessment, RiskManager, StopLossHit};
use super::venue::PredictionVenue;

// ---------------------------------------------------------------------------
// Configuration & types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub initial_balance: f64,
    /// PENDING orders older than this are cancelled by the monitor.
    pub order_timeout: Duration,
    /// Live-mode slippage cap between signal price and current price.
    pub max_slippage_pct: f64,
    /// Extend the slippage gate to SELL orders.
    pub slippage_gate_on_sell: bool,
    /// Prices older than this reject execution.
    pub price_max_age: Duration,
    /// Terminal pending orders are garbage-collected after this delay.
    pub pending_gc_delay: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            order_timeout: Duration::from_secs(30),
            max_slippage_pct: 0.02,
            slippage_gate_on_sell: false,
            price_max_age: Duration::from_secs(60),
            pending_gc_delay: Duration::from_secs(60),
        }
    }
}

/// Paper-mode fee rate.
const PAPER_FEE_RATE: f64 = 0.001;
/// Live-mode fee rate.
const LIVE_FEE_RATE: f64 = 0.02;

#[derive(Debug, Clone, Copy)]
struct PriceEntry {
    yes: f64,
    no: f64,
    updated: Instant,
}

/// Client-side record of one in-flight submission.
#[derive(Debug, Clone, Serialize)]
pub struct PendingOrder {
    pub id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub size_usd: f64,
    pub price: f64,
    pub status: PendingOrderStatus,
    pub reason: Option<String>,
    pub created_at: String,
    #[serde(skip)]
    created: Instant,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutionOutcome {
    Executed(Trade),
    Rejected(String),
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executed(t) => write!(f, "Executed({} {} @ {})", t.side, t.shares, t.price),
            Self::Rejected(reason) => write!(f, "Rejected({reason})"),
        }
    }
}

/// Result of an emergency close-all sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CloseAllReport {
    pub closed: u32,
    pub failed: u32,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PredictionExecutionEngine {
    mode: AccountMode,
    config: ExecutionConfig,
    cash: RwLock<f64>,
    realized_pnl: RwLock<f64>,
    positions: RwLock<HashMap<(String, Outcome), PredictionPosition>>,
    prices: RwLock<HashMap<String, PriceEntry>>,
    /// Arc so the GC task can hold the map past `&self`.
    pending: Arc<RwLock<HashMap<String, PendingOrder>>>,
    orders: RwLock<HashMap<String, OrderState>>,
    trades: RwLock<Vec<Trade>>,
    risk: Arc<RiskManager>,
    overfill: Arc<OverfillProtection>,
    venue: Arc<dyn PredictionVenue>,
    bus: Arc<MessageBus>,
}

impl PredictionExecutionEngine {
    pub fn new(
        mode: AccountMode,
        config: ExecutionConfig,
        risk: Arc<RiskManager>,
        overfill: Arc<OverfillProtection>,
        venue: Arc<dyn PredictionVenue>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let initial = config.initial_balance;
        Self {
            mode,
            config,
            cash: RwLock::new(initial),
            realized_pnl: RwLock::new(0.0),
            positions: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            pending: Arc::new(RwLock::new(HashMap::new())),
            orders: RwLock::new(HashMap::new()),
            trades: RwLock::new(Vec::new()),
            risk,
            overfill,
            venue,
            bus,
        }
    }

    // -------------------------------------------------------------------------
    // Market prices
    // -------------------------------------------------------------------------

    /// Refresh last prices for a market and mark every affected position to
    /// market.
    pub fn update_market_price(&self, market_id: &str, yes: f64, no: f64) {
        self.prices.write().insert(
            market_id.to_string(),
            PriceEntry {
                yes,
                no,
                updated: Instant::now(),
            },
        );

        let mut positions = self.positions.write();
        for ((mid, outcome), position) in positions.iter_mut() {
            if mid == market_id {
                position.last_price = match outcome {
                    Outcome::Yes => yes,
                    Outcome::No => no,
                };
                position.unrealized_pnl =
                    (position.last_price - position.average_price) * position.shares;
            }
        }
    }

    fn current_price(&self, market_id: &str, outcome: Outcome) -> Option<(f64, Instant)> {
        self.prices.read().get(market_id).map(|e| {
            (
                match outcome {
                    Outcome::Yes => e.yes,
                    Outcome::No => e.no,
                },
                e.updated,
            )
        })
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute a trade signal under its risk assessment.
    pub async fn execute_signal(
        &self,
        signal: &TradeSignal,
        risk: &RiskAssessment,
        market_title: &str,
    ) -> ExecutionOutcome {
        info!(
            market_id = %signal.market_id,
            outcome = %signal.outcome,
            action = ?signal.action,
            price = signal.price,
            size_usd = risk.suggested_size_usd,
            "execution signal received"
        );

        if let Err(reason) = self.validate_pre_execution(signal, risk) {
            warn!(market_id = %signal.market_id, reason = %reason, "pre-execution validation failed");
            return ExecutionOutcome::Rejected(reason);
        }

        // One concurrent exchange request per market.
        let pending_id = Uuid::new_v4().to_string();
        {
            let mut pending = self.pending.write();
            let already = pending.values().any(|p| {
                p.market_id == signal.market_id && p.status == PendingOrderStatus::Pending
            });
            if already {
                warn!(market_id = %signal.market_id, "rejected — pending order exists for market");
                return ExecutionOutcome::Rejected(format!(
                    "Pending order already exists for market {}",
                    signal.market_id
                ));
            }

            pending.insert(
                pending_id.clone(),
                PendingOrder {
                    id: pending_id.clone(),
                    market_id: signal.market_id.clone(),
                    outcome: signal.outcome,
                    side: signal_side(signal.action),
                    size_usd: risk.suggested_size_usd,
                    price: signal.price,
                    status: PendingOrderStatus::Pending,
                    reason: None,
                    created_at: Utc::now().to_rfc3339(),
                    created: Instant::now(),
                },
            );
        }

        match self.execute_trade(signal, risk, market_title).await {
            Ok(trade) => {
                self.set_pending_status(&pending_id, PendingOrderStatus::Filled, None);
                self.schedule_pending_gc(pending_id);

                self.risk.record_trade(&trade, self.portfolio().total_value);
                self.trades.write().push(trade.clone());

                self.bus.publish(
                    Channel::TradeExecuted,
                    serde_json::json!({
                        "trade_id": trade.trade_id,
                        "market_id": trade.market_id,
                        "market_title": market_title,
                        "side": trade.side.to_string(),
                        "outcome": trade.outcome.to_string(),
                        "shares": trade.shares,
                        "price": trade.price,
                        "fee": trade.fee,
                        "pnl": trade.pnl,
                    }),
                );
                self.bus.publish(
                    Channel::DailyPnl,
                    serde_json::json!({
                        "daily_pnl": self.risk.daily_state().daily_pnl,
                        "realized_pnl": *self.realized_pnl.read(),
                    }),
                );

                ExecutionOutcome::Executed(trade)
            }
            Err(reason) => {
                self.set_pending_status(
                    &pending_id,
                    PendingOrderStatus::Failed,
                    Some(reason.clone()),
                );
                self.schedule_pending_gc(pending_id);
                warn!(market_id = %signal.market_id, reason = %reason, "execution failed");
                ExecutionOutcome::Rejected(reason)
            }
        }
    }

    fn validate_pre_execution(
        &self,
        signal: &TradeSignal,
        risk: &RiskAssessment,
    ) -> Result<(), String> {
        if signal.action == SignalAction::Hold {
            return Err("HOLD signals are not executable".to_string());
        }
        if signal.price <= 0.0 || signal.price > 1.0 {
            return Err(format!("Invalid price {}", signal.price));
        }
        if !risk.approved {
            return Err(format!(
                "Risk assessment not approved: {}",
                risk.warnings.join("; ")
            ));
        }
        if risk.suggested_size_usd <= 0.0 {
            return Err("Suggested size is zero".to_string());
        }
        match self.current_price(&signal.market_id, signal.outcome) {
            None => Err(format!("No price for market {}", signal.market_id)),
            Some((_, updated)) if updated.elapsed() > self.config.price_max_age => {
                Err(format!(
                    "Price for {} is stale ({}s old)",
                    signal.market_id,
                    updated.elapsed().as_secs()
                ))
            }
            Some(_) => Ok(()),
        }
    }

    /// Trade mechanics. BUY spends cash into a position; SELL realizes PnL
    /// against the position's average price.
    async fn execute_trade(
        &self,
        signal: &TradeSignal,
        risk: &RiskAssessment,
        market_title: &str,
    ) -> Result<Trade, String> {
        let price = signal.price;
        let size = risk.suggested_size_usd;
        let side = signal_side(signal.action);
        let fee_rate = match self.mode {
            AccountMode::Paper => PAPER_FEE_RATE,
            AccountMode::Live => LIVE_FEE_RATE,
        };

        let (current, _) = self
            .current_price(&signal.market_id, signal.outcome)
            .ok_or_else(|| "price vanished mid-execution".to_string())?;

        // Live slippage gate (BUY always; SELL behind the config switch).
        if self.mode == AccountMode::Live
            && (side == OrderSide::Buy || self.config.slippage_gate_on_sell)
        {
            let slippage = (current - price).abs() / price;
            if slippage > self.config.max_slippage_pct {
                return Err(format!(
                    "Slippage {:.2}% exceeds cap {:.2}%",
                    slippage * 100.0,
                    self.config.max_slippage_pct * 100.0
                ));
            }
        }

        let key = (signal.market_id.clone(), signal.outcome);
        let now = Utc::now().to_rfc3339();

        let (shares, fee, pnl) = match side {
            OrderSide::Buy => {
                let shares = size / price;
                let fee = size * fee_rate;
                let cost = size + fee;
                {
                    let cash = self.cash.read();
                    if cost > *cash {
                        return Err(format!(
                            "Insufficient balance: need ${cost:.2}, have ${:.2}",
                            *cash
                        ));
                    }
                }

                // Live orders go to the venue before book-keeping.
                if self.mode == AccountMode::Live {
                    self.submit_live_order(signal, shares, price).await?;
                }

                *self.cash.write() -= cost;
                let mut positions = self.positions.write();
                match positions.get_mut(&key) {
                    Some(position) => {
                        let total_shares = position.shares + shares;
                        position.average_price = (position.average_price * position.shares
                            + price * shares)
                            / total_shares;
                        position.shares = total_shares;
                        position.last_price = current;
                        position.unrealized_pnl =
                            (current - position.average_price) * position.shares;
                    }
                    None => {
                        positions.insert(
                            key.clone(),
                            PredictionPosition {
                                market_id: signal.market_id.clone(),
                                market_title: market_title.to_string(),
                                outcome: signal.outcome,
                                shares,
                                average_price: price,
                                last_price: current,
                                unrealized_pnl: (current - price) * shares,
                                opened_at: now.clone(),
                            },
                        );
                    }
                }
                (shares, fee, 0.0)
            }
            OrderSide::Sell => {
                // Size the exit under a short read guard; never hold a lock
                // across the venue await.
                let (shares, proceeds, fee, pnl) = {
                    let positions = self.positions.read();
                    let position = positions.get(&key).ok_or_else(|| {
                        format!("No position in {} {}", signal.market_id, signal.outcome)
                    })?;
                    let requested = size / price;
                    let shares = requested.min(position.shares);
                    let proceeds = shares * price;
                    let fee = proceeds * fee_rate;
                    let pnl = (price - position.average_price) * shares;
                    (shares, proceeds, fee, pnl)
                };

                if self.mode == AccountMode::Live {
                    self.submit_live_order(signal, shares, price).await?;
                }

                let mut positions = self.positions.write();
                let position = positions
                    .get_mut(&key)
                    .ok_or_else(|| "position vanished mid-execution".to_string())?;
                position.shares -= shares;
                position.last_price = current;
                position.unrealized_pnl = (current - position.average_price) * position.shares;
                if position.shares <= SHARE_EPSILON {
                    positions.remove(&key);
                    debug!(market_id = %signal.market_id, "position closed (below epsilon)");
                }

                *self.cash.write() += proceeds - fee;
                *self.realized_pnl.write() += pnl;
                (shares, fee, pnl)
            }
        };

        Ok(Trade {
            trade_id: Uuid::new_v4().to_string(),
            market_id: signal.market_id.clone(),
            outcome: signal.outcome,
            side,
            shares,
            price,
            fee,
            pnl,
            reason: signal.rationale.clone(),
            executed_at: now,
        })
    }

    /// Submit the order to the live venue, tracking it in the order book and
    /// the overfill registry.
    async fn submit_live_order(
        &self,
        signal: &TradeSignal,
        shares: f64,
        price: f64,
    ) -> Result<(), String> {
        let order = OrderState {
            order_id: Uuid::new_v4().to_string(),
            client_order_id: Uuid::new_v4().to_string(),
            venue_order_id: None,
            market_id: signal.market_id.clone(),
            side: signal_side(signal.action),
            order_qty: shares,
            filled_qty: 0.0,
            avg_px: 0.0,
            status: OrderStatus::Pending,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.overfill.register_order(order.clone());
        self.orders.write().insert(order.order_id.clone(), order.clone());

        match self.venue.submit_order(&order, price).await {
            Ok(ack) => {
                let mut orders = self.orders.write();
                if let Some(stored) = orders.get_mut(&order.order_id) {
                    stored.venue_order_id = Some(ack.venue_order_id);
                    stored.status = OrderStatus::Open;
                }
                Ok(())
            }
            Err(e) => {
                let mut orders = self.orders.write();
                if let Some(stored) = orders.get_mut(&order.order_id) {
                    stored.status = OrderStatus::Rejected;
                }
                self.overfill.unregister_order(&order.order_id);
                Err(format!("Venue rejected order: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pending-order lifecycle
    // -------------------------------------------------------------------------

    fn set_pending_status(&self, id: &str, status: PendingOrderStatus, reason: Option<String>) {
        if let Some(pending) = self.pending.write().get_mut(id) {
            pending.status = status;
            pending.reason = reason;
        }
    }

    /// Remove a terminal pending order after the GC delay.
    fn schedule_pending_gc(&self, id: String) {
        let pending = Arc::clone(&self.pending);
        let delay = self.config.pending_gc_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.write().remove(&id);
        });
    }

    /// PENDING orders older than the timeout become CANCELLED.
    pub fn expire_stale_pending(&self) -> u32 {
        let mut expired = 0;
        let mut pending = self.pending.write();
        for order in pending.values_mut() {
            if order.status == PendingOrderStatus::Pending
                && order.created.elapsed() > self.config.order_timeout
            {
                order.status = PendingOrderStatus::Cancelled;
                order.reason = Some("Order timeout".to_string());
                expired += 1;
                warn!(pending_id = %order.id, market_id = %order.market_id, "pending order timed out");
            }
        }
        expired
    }

    /// Spawn the 10 s pending-order monitor.
    pub fn spawn_pending_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                engine.expire_stale_pending();
            }
        })
    }

    // -------------------------------------------------------------------------
    // Stop losses & emergency close
    // -------------------------------------------------------------------------

    /// Deterministic sweep over current positions (same contract as the risk
    /// manager's).
    pub fn check_stop_losses(&self) -> Vec<StopLossHit> {
        let positions = self.positions();
        self.risk.check_stop_losses(&positions)
    }

    /// Close every open position at its last price, synchronously.
    pub fn emergency_close_all(&self) -> CloseAllReport {
        let mut report = CloseAllReport {
            closed: 0,
            failed: 0,
            total_pnl: 0.0,
        };

        let keys: Vec<(String, Outcome)> = self.positions.read().keys().cloned().collect();
        for key in keys {
            let position = match self.positions.write().remove(&key) {
                Some(p) => p,
                None => continue,
            };
            if position.last_price <= 0.0 {
                warn!(market_id = %position.market_id, "cannot close position without a price");
                report.failed += 1;
                // Keep the position; a later reconcile pass deals with it.
                self.positions.write().insert(key, position);
                continue;
            }

            let pnl = (position.last_price - position.average_price) * position.shares;
            *self.cash.write() += position.shares * position.last_price;
            *self.realized_pnl.write() += pnl;
            report.total_pnl += pnl;
            report.closed += 1;

            self.trades.write().push(Trade {
                trade_id: Uuid::new_v4().to_string(),
                market_id: position.market_id.clone(),
                outcome: position.outcome,
                side: OrderSide::Sell,
                shares: position.shares,
                price: position.last_price,
                fee: 0.0,
                pnl,
                reason: "EMERGENCY CLOSE".to_string(),
                executed_at: Utc::now().to_rfc3339(),
            });
            info!(market_id = %position.market_id, pnl, "position emergency-closed");
        }

        warn!(
            closed = report.closed,
            failed = report.failed,
            total_pnl = report.total_pnl,
            "emergency close-all complete"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Venue fills
    // -------------------------------------------------------------------------

    /// Apply an exchange-reported fill to its tracked order, under overfill
    /// protection. Duplicate fill ids are ignored; out-of-tolerance overfills
    /// resolve per the configured policy (allow / auto-adjust / reject).
    pub fn apply_venue_fill(&self, fill: &super::model::Fill) -> crate::resilience::overfill::FillVerdict {
        if let Err(reason) = self.overfill.validate_fill_for_order(fill, &fill.order_id) {
            warn!(fill_id = %fill.fill_id, reason = %reason, "venue fill failed validation");
            return crate::resilience::overfill::FillVerdict {
                allowed: false,
                reason: Some(reason),
                adjusted_fill: None,
                handled: None,
            };
        }

        let verdict = self
            .overfill
            .check_fill(&fill.order_id, fill.fill_qty, fill.fill_px);
        if !verdict.allowed {
            return verdict;
        }

        let (qty, px) = verdict
            .adjusted_fill
            .map(|a| (a.qty, a.px))
            .unwrap_or((fill.fill_qty, fill.fill_px));
        let effective = super::model::Fill {
            fill_qty: qty,
            fill_px: px,
            ..fill.clone()
        };

        if self.overfill.record_fill(&effective) {
            // Mirror the registry's view into the snapshot-facing order book.
            if let Some(updated) = self.overfill.get_order(&fill.order_id) {
                self.orders
                    .write()
                    .insert(updated.order_id.clone(), updated);
            }
            debug!(fill_id = %fill.fill_id, order_id = %fill.order_id, qty, px, "venue fill applied");
        }
        verdict
    }

    /// Markets with an open position whose price has not refreshed within
    /// `max_age` (reconciler staleness input).
    pub fn stale_markets(&self, max_age: chrono::Duration) -> Vec<String> {
        let max_age = max_age.to_std().unwrap_or_default();
        let prices = self.prices.read();
        let positions = self.positions.read();

        let mut markets: Vec<String> = positions.keys().map(|(m, _)| m.clone()).collect();
        markets.sort();
        markets.dedup();
        markets
            .into_iter()
            .filter(|m| {
                prices
                    .get(m)
                    .map(|e| e.updated.elapsed() > max_age)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Close every position on the given markets at its last price without
    /// touching the venue (orphan cleanup). Returns the closed count.
    pub fn close_markets_locally(&self, market_ids: &[String]) -> u32 {
        let mut closed = 0;
        let keys: Vec<(String, Outcome)> = self
            .positions
            .read()
            .keys()
            .filter(|(m, _)| market_ids.contains(m))
            .cloned()
            .collect();

        for key in keys {
            let position = match self.positions.write().remove(&key) {
                Some(p) => p,
                None => continue,
            };
            let pnl = (position.last_price - position.average_price) * position.shares;
            *self.cash.write() += position.shares * position.last_price;
            *self.realized_pnl.write() += pnl;
            closed += 1;

            self.trades.write().push(Trade {
                trade_id: Uuid::new_v4().to_string(),
                market_id: position.market_id.clone(),
                outcome: position.outcome,
                side: OrderSide::Sell,
                shares: position.shares,
                price: position.last_price,
                fee: 0.0,
                pnl,
                reason: "ORPHAN CLOSE".to_string(),
                executed_at: Utc::now().to_rfc3339(),
            });
            warn!(market_id = %position.market_id, pnl, "orphaned position closed locally");
        }
        closed
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    /// Derived portfolio: cash plus marked-to-market positions.
    pub fn portfolio(&self) -> Portfolio {
        let cash = *self.cash.read();
        let positions = self.positions.read();
        let market_value: f64 = positions.values().map(|p| p.shares * p.last_price).sum();
        let used: f64 = positions.values().map(|p| p.shares * p.average_price).sum();
        let unrealized: f64 = positions.values().map(|p| p.unrealized_pnl).sum();

        Portfolio {
            total_value: cash + market_value,
            available_balance: cash,
            used_balance: used,
            realized_pnl: *self.realized_pnl.read(),
            unrealized_pnl: unrealized,
            position_count: positions.len(),
        }
    }

    pub fn positions(&self) -> Vec<PredictionPosition> {
        self.positions.read().values().cloned().collect()
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending.read().values().cloned().collect()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.read().clone()
    }

    pub fn mode(&self) -> AccountMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // Snapshot restore
    // -------------------------------------------------------------------------

    /// Reconstitute positions and orders from a snapshot. Keyed replacement
    /// makes a second application of the same snapshot a no-op.
    pub fn restore_from_snapshot(&self, snapshot: &Snapshot) {
        {
            let mut positions = self.positions.write();
            positions.clear();
            for position in &snapshot.positions {
                positions.insert(position.key(), position.clone());
            }
        }
        {
            let mut orders = self.orders.write();
            orders.clear();
            for order in &snapshot.orders {
                orders.insert(order.order_id.clone(), order.clone());
            }
        }
        if let Some(portfolio) = &snapshot.portfolio {
            *self.cash.write() = portfolio.available_balance;
            *self.realized_pnl.write() = portfolio.realized_pnl;
        }
        info!(
            snapshot_id = %snapshot.metadata.id,
            positions = snapshot.positions.len(),
            orders = snapshot.orders.len(),
            "state restored from snapshot"
        );
    }
}

impl SnapshotSource for PredictionExecutionEngine {
    fn orders(&self) -> Vec<OrderState> {
        self.orders.read().values().cloned().collect()
    }

    fn positions(&self) -> Vec<PredictionPosition> {
        self.positions.read().values().cloned().collect()
    }

    fn portfolio(&self) -> Option<Portfolio> {
        Some(self.portfolio())
    }
}

impl std::fmt::Debug for PredictionExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionExecutionEngine")
            .field("mode", &self.mode)
            .field("cash", &*self.cash.read())
            .field("positions", &self.positions.read().len())
            .field("pending", &self.pending.read().len())
            .finish()
    }
}

fn signal_side(action: SignalAction) -> OrderSide {
    match action {
        SignalAction::Sell => OrderSide::Sell,
        // HOLD is rejected before reaching trade mechanics.
        _ => OrderSide::Buy,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::risk::{MemoryDailyStateStore, RiskLimits, RiskManager};
    use crate::prediction::venue::PaperVenue;
    use crate::resilience::overfill::OverfillConfig;

    fn engine(mode: AccountMode) -> Arc<PredictionExecutionEngine> {
        let risk = Arc::new(RiskManager::new(
            RiskLimits::default(),
            Box::new(MemoryDailyStateStore::default()),
        ));
        Arc::new(PredictionExecutionEngine::new(
            mode,
            ExecutionConfig::default(),
            risk,
            Arc::new(OverfillProtection::new(OverfillConfig::default())),
            Arc::new(PaperVenue::new()),
            Arc::new(MessageBus::new()),
        ))
    }

    fn signal(market_id: &str, action: SignalAction, price: f64) -> TradeSignal {
        TradeSignal {
            market_id: market_id.into(),
            outcome: Outcome::Yes,
            action,
            price,
            rationale: "test signal".into(),
        }
    }

    fn approved(size: f64) -> RiskAssessment {
        RiskAssessment {
            approved: true,
            suggested_size_usd: size,
            risk_score: 0.2,
            max_loss_usd: size * 0.2,
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn buy_moves_cash_into_position() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.50, 0.50);

        let before = engine.portfolio().available_balance;
        let outcome = engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.50), &approved(100.0), "Market One")
            .await;

        let trade = match outcome {
            ExecutionOutcome::Executed(t) => t,
            ExecutionOutcome::Rejected(r) => panic!("rejected: {r}"),
        };
        // shares = 100 / 0.5 = 200; fee = 100 * 0.001.
        assert!((trade.shares - 200.0).abs() < 1e-9);
        assert!((trade.fee - 0.1).abs() < 1e-9);

        let after = engine.portfolio().available_balance;
        assert!((before - after - (trade.shares * trade.price + trade.fee)).abs() < 1e-9);

        let positions = engine.positions();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].shares - 200.0).abs() < 1e-9);
        assert_eq!(positions[0].market_title, "Market One");
    }

    #[tokio::test]
    async fn sell_realizes_pnl_against_average_price() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.40, 0.60);
        engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.40), &approved(80.0), "M")
            .await;

        // Price rises; sell everything at 0.50.
        engine.update_market_price("mkt-1", 0.50, 0.50);
        let realized_before = engine.portfolio().realized_pnl;
        let outcome = engine
            .execute_signal(&signal("mkt-1", SignalAction::Sell, 0.50), &approved(100.0), "M")
            .await;

        let trade = match outcome {
            ExecutionOutcome::Executed(t) => t,
            ExecutionOutcome::Rejected(r) => panic!("rejected: {r}"),
        };
        // Bought 200 shares at 0.40; sell capped at the 200 held.
        assert!((trade.shares - 200.0).abs() < 1e-9);
        let realized_after = engine.portfolio().realized_pnl;
        assert!((realized_after - realized_before - (0.50 - 0.40) * 200.0).abs() < 1e-9);

        // Fully sold: position removed.
        assert!(engine.positions().is_empty());
    }

    #[tokio::test]
    async fn hold_and_unapproved_are_rejected() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.5, 0.5);

        let hold = engine
            .execute_signal(&signal("mkt-1", SignalAction::Hold, 0.5), &approved(100.0), "M")
            .await;
        assert!(matches!(hold, ExecutionOutcome::Rejected(ref r) if r.contains("HOLD")));

        let mut unapproved = approved(100.0);
        unapproved.approved = false;
        unapproved.suggested_size_usd = 0.0;
        let rejected = engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.5), &unapproved, "M")
            .await;
        assert!(matches!(rejected, ExecutionOutcome::Rejected(ref r) if r.contains("not approved")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_price_rejects_execution() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.5, 0.5);

        tokio::time::advance(Duration::from_secs(61)).await;
        let outcome = engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.5), &approved(100.0), "M")
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected(ref r) if r.contains("stale")));
    }

    #[tokio::test]
    async fn insufficient_balance_rejects() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.5, 0.5);
        let outcome = engine
            .execute_signal(
                &signal("mkt-1", SignalAction::Buy, 0.5),
                &approved(50_000.0),
                "M",
            )
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected(ref r) if r.contains("Insufficient")));
    }

    #[tokio::test]
    async fn pending_gate_blocks_second_order_on_market() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.5, 0.5);

        // Simulate an in-flight submission.
        engine.pending.write().insert(
            "p-1".into(),
            PendingOrder {
                id: "p-1".into(),
                market_id: "mkt-1".into(),
                outcome: Outcome::Yes,
                side: OrderSide::Buy,
                size_usd: 100.0,
                price: 0.5,
                status: PendingOrderStatus::Pending,
                reason: None,
                created_at: Utc::now().to_rfc3339(),
                created: Instant::now(),
            },
        );

        let outcome = engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.5), &approved(100.0), "M")
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected(ref r) if r.contains("Pending order")));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_orders_time_out() {
        let engine = engine(AccountMode::Paper);
        engine.pending.write().insert(
            "p-1".into(),
            PendingOrder {
                id: "p-1".into(),
                market_id: "mkt-1".into(),
                outcome: Outcome::Yes,
                side: OrderSide::Buy,
                size_usd: 100.0,
                price: 0.5,
                status: PendingOrderStatus::Pending,
                reason: None,
                created_at: Utc::now().to_rfc3339(),
                created: Instant::now(),
            },
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(engine.expire_stale_pending(), 1);

        let orders = engine.pending_orders();
        assert_eq!(orders[0].status, PendingOrderStatus::Cancelled);
        assert_eq!(orders[0].reason.as_deref(), Some("Order timeout"));
    }

    #[tokio::test]
    async fn live_slippage_gate_on_buy() {
        let engine = engine(AccountMode::Live);
        // Current price 0.60 vs signal price 0.50: 20 % slippage.
        engine.update_market_price("mkt-1", 0.60, 0.40);
        let outcome = engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.50), &approved(100.0), "M")
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected(ref r) if r.contains("Slippage")));
    }

    #[tokio::test]
    async fn emergency_close_all_realizes_everything() {
        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.40, 0.60);
        engine.update_market_price("mkt-2", 0.50, 0.50);
        engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.40), &approved(80.0), "M1")
            .await;
        engine
            .execute_signal(&signal("mkt-2", SignalAction::Buy, 0.50), &approved(100.0), "M2")
            .await;

        // mkt-1 rallies to 0.50.
        engine.update_market_price("mkt-1", 0.50, 0.50);

        let report = engine.emergency_close_all();
        assert_eq!(report.closed, 2);
        assert_eq!(report.failed, 0);
        // mkt-1: (0.50-0.40)*200 = +20; mkt-2 flat.
        assert!((report.total_pnl - 20.0).abs() < 1e-9);
        assert!(engine.positions().is_empty());

        let reasons: Vec<String> = engine.trades().iter().map(|t| t.reason.clone()).collect();
        assert!(reasons.iter().filter(|r| *r == "EMERGENCY CLOSE").count() == 2);
    }

    #[tokio::test]
    async fn venue_fill_flows_through_overfill_protection() {
        use crate::prediction::model::{Fill, OrderState, OrderStatus};
        use crate::resilience::overfill::OverfillHandling;

        let engine = engine(AccountMode::Paper);
        engine.overfill.register_order(OrderState {
            order_id: "o-1".into(),
            client_order_id: "c-1".into(),
            venue_order_id: None,
            market_id: "mkt-1".into(),
            side: OrderSide::Buy,
            order_qty: 100.0,
            filled_qty: 90.0,
            avg_px: 0.5,
            status: OrderStatus::Open,
            timestamp: Utc::now().to_rfc3339(),
        });

        let fill = Fill {
            fill_id: "f-1".into(),
            order_id: "o-1".into(),
            symbol: "mkt-1".into(),
            side: OrderSide::Buy,
            fill_qty: 15.0,
            fill_px: 0.52,
            timestamp: Utc::now().to_rfc3339(),
        };

        // Overfill of 5 over the remaining 10: auto-adjusted down.
        let verdict = engine.apply_venue_fill(&fill);
        assert!(verdict.allowed);
        assert_eq!(verdict.handled, Some(OverfillHandling::Adjusted));

        let order = engine.overfill.get_order("o-1").unwrap();
        assert!((order.filled_qty - 100.0).abs() < f64::EPSILON);
        assert_eq!(order.status, OrderStatus::Filled);

        // The same fill id arriving again changes nothing.
        let dup = engine.apply_venue_fill(&fill);
        assert!(dup.allowed);
        let order_after = engine.overfill.get_order("o-1").unwrap();
        assert!((order_after.filled_qty - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        use crate::resilience::snapshot::{SnapshotService, SnapshotType};

        let engine = engine(AccountMode::Paper);
        engine.update_market_price("mkt-1", 0.40, 0.60);
        engine
            .execute_signal(&signal("mkt-1", SignalAction::Buy, 0.40), &approved(80.0), "M")
            .await;

        let service = SnapshotService::new(engine.clone(), 10, chrono::Duration::hours(1));
        let snapshot = service.create_snapshot(SnapshotType::Full, None, None);

        // Restore into a fresh engine and re-snapshot: identical books.
        let fresh = engine2();
        fresh.restore_from_snapshot(&snapshot);
        let service2 = SnapshotService::new(fresh.clone(), 10, chrono::Duration::hours(1));
        let second = service2.create_snapshot(SnapshotType::Full, None, None);

        let diff = SnapshotService::compare_snapshots(&snapshot, &second);
        assert!(diff.positions.added.is_empty());
        assert!(diff.positions.removed.is_empty());
        assert!(diff.positions.changed.is_empty());
        assert!(diff.orders.added.is_empty());
        assert!(diff.orders.removed.is_empty());

        // Idempotent: applying the same snapshot twice changes nothing.
        fresh.restore_from_snapshot(&snapshot);
        let third = service2.create_snapshot(SnapshotType::Full, None, None);
        let diff2 = SnapshotService::compare_snapshots(&second, &third);
        assert!(diff2.positions.changed.is_empty());

        let a = engine.portfolio();
        let b = fresh.portfolio();
        assert!((a.available_balance - b.available_balance).abs() < 1e-9);
        assert!((a.used_balance - b.used_balance).abs() < 1e-9);
    }

    fn engine2() -> Arc<PredictionExecutionEngine> {
        engine(AccountMode::Paper)
    }
}
