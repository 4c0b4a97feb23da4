// =============================================================================
// Prediction-market data model — markets, ideas, orders, fills, positions
// =============================================================================
//
// All prices on binary outcome markets live in [0, 1]. Positions are keyed by
// (market_id, outcome); a position with shares <= SHARE_EPSILON is removed.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Positions at or below this share count are treated as closed.
pub const SHARE_EPSILON: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Which side of a binary market an idea or position is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "YES"),
            Self::No => write!(f, "NO"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Venue-visible order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Canceled,
    Rejected,
}

/// Client-side in-flight submission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOrderStatus {
    Pending,
    Filled,
    Partial,
    Cancelled,
    Failed,
}

/// What a trade signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Terminal and intermediate steps of one agent cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStep {
    Init,
    MarketData,
    NewsContext,
    Theorize,
    Backtest,
    IdeaSelected,
    RiskChecked,
    Executed,
    SkippedExec,
    Learned,
    Idle,
    Error,
    EmergencyStop,
    NoMarkets,
}

impl std::fmt::Display for CycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::MarketData => "MARKET_DATA",
            Self::NewsContext => "NEWS_CONTEXT",
            Self::Theorize => "THEORIZE",
            Self::Backtest => "BACKTEST",
            Self::IdeaSelected => "IDEA_SELECTED",
            Self::RiskChecked => "RISK_CHECKED",
            Self::Executed => "EXECUTED",
            Self::SkippedExec => "SKIPPED_EXEC",
            Self::Learned => "LEARNED",
            Self::Idle => "IDLE",
            Self::Error => "ERROR",
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::NoMarkets => "NO_MARKETS",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Markets & ideas
// ---------------------------------------------------------------------------

/// One binary outcome market as seen from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionMarket {
    pub market_id: String,
    pub title: String,
    pub outcomes: Vec<String>,
    /// Last traded YES price in [0, 1].
    pub last_yes_price: f64,
    /// Last traded NO price in [0, 1].
    pub last_no_price: f64,
    pub volume: f64,
    #[serde(default)]
    pub open_until: Option<DateTime<Utc>>,
}

/// A theorized trade idea before risk assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionIdea {
    pub id: String,
    pub market_id: String,
    /// Venue market title; feeds the correlation gate.
    pub market_title: String,
    pub outcome: Outcome,
    /// Signed edge estimate: model fair price minus market price.
    pub edge: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub rationale: String,
    pub heat_score: f64,
    pub sentiment_score: f64,
    pub linked_news_count: u32,
    pub linked_cluster_count: u32,
    pub time_horizon: String,
}

/// A signal derived from the selected idea, handed to the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub market_id: String,
    pub outcome: Outcome,
    pub action: SignalAction,
    /// Price the signal was formed at.
    pub price: f64,
    pub rationale: String,
}

// ---------------------------------------------------------------------------
// Orders & fills
// ---------------------------------------------------------------------------

/// Book-kept state of one order, venue-acknowledged or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    pub client_order_id: String,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    pub market_id: String,
    pub side: OrderSide,
    pub order_qty: f64,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub avg_px: f64,
    pub status: OrderStatus,
    /// ISO 8601 creation time.
    pub timestamp: String,
}

/// One exchange-reported fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub fill_qty: f64,
    pub fill_px: f64,
    /// ISO 8601 fill time.
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Positions & portfolio
// ---------------------------------------------------------------------------

/// An open position on one (market, outcome) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPosition {
    pub market_id: String,
    #[serde(default)]
    pub market_title: String,
    pub outcome: Outcome,
    pub shares: f64,
    pub average_price: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    /// ISO 8601 open time.
    pub opened_at: String,
}

impl PredictionPosition {
    /// Key used by the execution engine's position map.
    pub fn key(&self) -> (String, Outcome) {
        (self.market_id.clone(), self.outcome)
    }
}

/// Derived portfolio view: cash plus marked-to-market positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub total_value: f64,
    pub available_balance: f64,
    pub used_balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub position_count: usize,
}

/// A persisted executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub shares: f64,
    pub price: f64,
    pub fee: f64,
    pub pnl: f64,
    pub reason: String,
    /// ISO 8601 execution time.
    pub executed_at: String,
}

// ---------------------------------------------------------------------------
// Daily risk state
// ---------------------------------------------------------------------------

/// Per-local-day mutable risk counters. Created on first access each day,
/// reset at local midnight, persisted on mutation. `emergency_stop_triggered`
/// survives the daily reset and only clears via an explicit admin reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRiskState {
    /// Local date, YYYY-MM-DD.
    pub date: String,
    /// Trades executed today.
    pub trades: u32,
    /// Lifetime trade count across days.
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub daily_pnl: f64,
    #[serde(default)]
    pub last_trade_time: Option<String>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub emergency_stop_triggered: bool,
}

impl DailyRiskState {
    pub fn new_for(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            trades: 0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            daily_pnl: 0.0,
            last_trade_time: None,
            cooldown_until: None,
            emergency_stop_triggered: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent status
// ---------------------------------------------------------------------------

/// Coarse run state of an agent as pushed on every cycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRunState {
    Running,
    Idle,
    Error,
}

/// One status record per cycle transition, persisted for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: String,
    pub status: AgentRunState,
    pub current_step: CycleStep,
    pub cycle_id: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub portfolio: Option<Portfolio>,
    /// Markets with news coverage this cycle / markets scanned.
    #[serde(default)]
    pub market_intel_coverage: Option<(u32, u32)>,
    /// ISO 8601 record time.
    pub at: String,
}
