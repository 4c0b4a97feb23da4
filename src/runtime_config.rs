// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Argus engine. Every tunable lives here so
// the engine can be reconfigured at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Recognized environment variables are
// applied on top of the loaded file by `apply_env`.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::news::assignment::AssignmentConfig;
use crate::news::orchestrator::NewsConfig;
use crate::prediction::execution::ExecutionConfig;
use crate::prediction::risk::RiskLimits;
use crate::types::{AccountMode, EngineMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_categories() -> Vec<String> {
    vec![
        "MACRO".to_string(),
        "CRYPTO".to_string(),
        "STOCKS".to_string(),
        "POLITICS".to_string(),
    ]
}

fn default_news_cycle_interval_ms() -> u64 {
    60_000
}

fn default_queries_per_category() -> u32 {
    3
}

fn default_vector_distance_threshold() -> f64 {
    0.68
}

fn default_cluster_batch_size() -> usize {
    20
}

fn default_paper_balance() -> f64 {
    10_000.0
}

fn default_order_timeout_ms() -> u64 {
    30_000
}

fn default_max_slippage_pct() -> f64 {
    0.02
}

fn default_max_daily_loss_pct() -> f64 {
    0.02
}

fn default_max_daily_loss_usd() -> f64 {
    100.0
}

fn default_max_daily_trades() -> u32 {
    5
}

fn default_max_portfolio_heat_pct() -> f64 {
    0.30
}

fn default_max_positions() -> usize {
    10
}

fn default_max_position_pct() -> f64 {
    0.05
}

fn default_cooldown_minutes() -> i64 {
    30
}

fn default_cooldown_after_win_min() -> i64 {
    5
}

fn default_stop_loss_pct() -> f64 {
    0.20
}

fn default_max_correlated_positions() -> usize {
    2
}

fn default_emergency_stop_loss() -> f64 {
    0.05
}

fn default_min_market_volume() -> f64 {
    1_000.0
}

fn default_max_market_age_days() -> i64 {
    90
}

fn default_api_base() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_clob_base() -> String {
    "https://clob.polymarket.com".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration. Every field has a serde default so older
/// JSON files missing new fields still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------
    #[serde(default)]
    pub engine_mode: EngineMode,

    #[serde(default)]
    pub account_mode: AccountMode,

    // --- News pipeline -------------------------------------------------------
    #[serde(default = "default_news_cycle_interval_ms")]
    pub news_cycle_interval_ms: u64,

    /// One category per cycle instead of all categories.
    #[serde(default)]
    pub news_rotation_mode: bool,

    #[serde(default = "default_categories")]
    pub news_categories: Vec<String>,

    #[serde(default = "default_queries_per_category")]
    pub news_queries_per_category: u32,

    /// Vector-assignment distance cutoff.
    #[serde(default = "default_vector_distance_threshold")]
    pub news_vector_distance_threshold: f64,

    /// Scope vector search to the article's primary category.
    #[serde(default = "default_true")]
    pub news_vector_filter_by_category: bool,

    /// Secondary LLM for labeling fallback.
    #[serde(default)]
    pub news_use_glm: bool,

    /// Title pre-clustering + semantic fallback tier.
    #[serde(default = "default_true")]
    pub enhanced_semantic_clustering: bool,

    /// Enhanced clustering path (tiers 2/3 + merge pass).
    #[serde(default = "default_true")]
    pub enhanced_clustering_enabled: bool,

    #[serde(default = "default_cluster_batch_size")]
    pub cluster_batch_size: usize,

    // --- Prediction agent ----------------------------------------------------
    #[serde(default = "default_paper_balance")]
    pub prediction_paper_balance: f64,

    /// `false` switches to live-trading gating.
    #[serde(default = "default_true")]
    pub prediction_paper_trading: bool,

    #[serde(default = "default_order_timeout_ms")]
    pub prediction_order_timeout_ms: u64,

    #[serde(default = "default_max_slippage_pct")]
    pub prediction_max_slippage_pct: f64,

    #[serde(default = "default_max_daily_loss_pct")]
    pub prediction_max_daily_loss_pct: f64,

    #[serde(default = "default_max_daily_loss_usd")]
    pub prediction_max_daily_loss_usd: f64,

    #[serde(default = "default_max_daily_trades")]
    pub prediction_max_daily_trades: u32,

    #[serde(default = "default_max_portfolio_heat_pct")]
    pub prediction_max_portfolio_heat_pct: f64,

    #[serde(default = "default_max_positions")]
    pub prediction_max_positions: usize,

    #[serde(default = "default_max_position_pct")]
    pub prediction_max_position_pct: f64,

    #[serde(default = "default_cooldown_minutes")]
    pub prediction_cooldown_minutes: i64,

    #[serde(default = "default_cooldown_after_win_min")]
    pub prediction_cooldown_after_win_min: i64,

    #[serde(default = "default_stop_loss_pct")]
    pub prediction_stop_loss_pct: f64,

    #[serde(default = "default_true")]
    pub prediction_enable_correlation_check: bool,

    #[serde(default = "default_max_correlated_positions")]
    pub prediction_max_correlated_pos: usize,

    /// Fraction of portfolio lost in a day that auto-halts trading.
    #[serde(default = "default_emergency_stop_loss")]
    pub prediction_emergency_stop_loss: f64,

    #[serde(default = "default_min_market_volume")]
    pub prediction_min_market_volume: f64,

    #[serde(default = "default_max_market_age_days")]
    pub prediction_max_market_age_days: i64,

    // --- Endpoints -----------------------------------------------------------
    #[serde(default = "default_api_base")]
    pub polymarket_api_base: String,

    #[serde(default = "default_clob_base")]
    pub polymarket_clob_base: String,

    /// Empty disables the LLM entirely.
    #[serde(default)]
    pub llm_endpoint: String,

    // --- Behavior switches (recorded design decisions) -----------------------
    /// Extend the live slippage gate to SELL orders.
    #[serde(default)]
    pub slippage_gate_on_sell: bool,

    /// Count non-429 4xx responses as circuit-breaker failures.
    #[serde(default)]
    pub count_client_errors_as_failures: bool,

    /// Let the reconciler close orphaned book positions without confirmation.
    #[serde(default)]
    pub reconcile_auto_close_orphans: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises via defaults")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            engine_mode = %config.engine_mode,
            account_mode = %config.account_mode,
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    // =========================================================================
    // Environment overrides
    // =========================================================================

    /// Apply every recognized environment variable on top of the loaded
    /// values. Unparseable values are warned about and ignored.
    pub fn apply_env(&mut self) {
        env_u64("NEWS_CYCLE_INTERVAL_MS", &mut self.news_cycle_interval_ms);
        env_bool("NEWS_ROTATION_MODE", &mut self.news_rotation_mode);
        env_u32("NEWS_QUERIES_PER_CATEGORY", &mut self.news_queries_per_category);
        env_f64(
            "NEWS_VECTOR_DISTANCE_THRESHOLD",
            &mut self.news_vector_distance_threshold,
        );
        env_bool(
            "NEWS_VECTOR_FILTER_BY_CATEGORY",
            &mut self.news_vector_filter_by_category,
        );
        env_bool("NEWS_USE_GLM", &mut self.news_use_glm);
        env_bool(
            "USE_ENHANCED_SEMANTIC_CLUSTERING",
            &mut self.enhanced_semantic_clustering,
        );
        env_usize("CLUSTER_BATCH_SIZE", &mut self.cluster_batch_size);
        env_bool("ENHANCED_CLUSTERING_ENABLED", &mut self.enhanced_clustering_enabled);
        env_bool("USE_ENHANCED_CLUSTERING", &mut self.enhanced_clustering_enabled);

        env_f64("PREDICTION_PAPER_BALANCE", &mut self.prediction_paper_balance);
        env_bool("PREDICTION_PAPER_TRADING", &mut self.prediction_paper_trading);
        env_u64("PREDICTION_ORDER_TIMEOUT_MS", &mut self.prediction_order_timeout_ms);
        env_f64("PREDICTION_MAX_SLIPPAGE_PCT", &mut self.prediction_max_slippage_pct);
        env_f64(
            "PREDICTION_MAX_DAILY_LOSS_PCT",
            &mut self.prediction_max_daily_loss_pct,
        );
        env_f64(
            "PREDICTION_MAX_DAILY_LOSS_USD",
            &mut self.prediction_max_daily_loss_usd,
        );
        env_u32(
            "PREDICTION_MAX_DAILY_TRADES",
            &mut self.prediction_max_daily_trades,
        );
        env_f64(
            "PREDICTION_MAX_PORTFOLIO_HEAT_PCT",
            &mut self.prediction_max_portfolio_heat_pct,
        );
        env_usize("PREDICTION_MAX_POSITIONS", &mut self.prediction_max_positions);
        env_f64("PREDICTION_MAX_POSITION_PCT", &mut self.prediction_max_position_pct);
        env_i64("PREDICTION_COOLDOWN_MINUTES", &mut self.prediction_cooldown_minutes);
        env_i64(
            "PREDICTION_COOLDOWN_AFTER_WIN_MIN",
            &mut self.prediction_cooldown_after_win_min,
        );
        env_f64("PREDICTION_STOP_LOSS_PCT", &mut self.prediction_stop_loss_pct);
        env_bool(
            "PREDICTION_ENABLE_CORRELATION_CHECK",
            &mut self.prediction_enable_correlation_check,
        );
        env_usize(
            "PREDICTION_MAX_CORRELATED_POS",
            &mut self.prediction_max_correlated_pos,
        );
        env_f64(
            "PREDICTION_EMERGENCY_STOP_LOSS",
            &mut self.prediction_emergency_stop_loss,
        );

        env_string("POLYMARKET_API_BASE", &mut self.polymarket_api_base);
        env_string("POLYMARKET_CLOB_BASE", &mut self.polymarket_clob_base);
        env_string("ARGUS_LLM_ENDPOINT", &mut self.llm_endpoint);

        if !self.prediction_paper_trading {
            self.account_mode = AccountMode::Live;
        }
    }

    // =========================================================================
    // Derived sub-configs
    // =========================================================================

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_daily_loss_pct: self.prediction_max_daily_loss_pct,
            max_daily_loss_usd: self.prediction_max_daily_loss_usd,
            max_daily_trades: self.prediction_max_daily_trades,
            max_portfolio_heat_pct: self.prediction_max_portfolio_heat_pct,
            max_positions: self.prediction_max_positions,
            max_position_pct: self.prediction_max_position_pct,
            cooldown_after_loss_minutes: self.prediction_cooldown_minutes,
            cooldown_after_win_minutes: self.prediction_cooldown_after_win_min,
            stop_loss_pct: self.prediction_stop_loss_pct,
            enable_correlation_check: self.prediction_enable_correlation_check,
            max_correlated_positions: self.prediction_max_correlated_pos,
            max_slippage_pct: self.prediction_max_slippage_pct,
            min_market_volume: self.prediction_min_market_volume,
            max_market_age_days: self.prediction_max_market_age_days,
            emergency_stop_daily_loss: self.prediction_emergency_stop_loss,
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            initial_balance: self.prediction_paper_balance,
            order_timeout: std::time::Duration::from_millis(self.prediction_order_timeout_ms)
                .into(),
            max_slippage_pct: self.prediction_max_slippage_pct,
            slippage_gate_on_sell: self.slippage_gate_on_sell,
            ..ExecutionConfig::default()
        }
    }

    pub fn news_config(&self) -> NewsConfig {
        NewsConfig {
            categories: self.news_categories.clone(),
            rotation_mode: self.news_rotation_mode,
            queries_per_category: self.news_queries_per_category,
            enhanced_clustering: self.enhanced_clustering_enabled,
            stage_concurrency: 5,
        }
    }

    pub fn assignment_config(&self) -> AssignmentConfig {
        AssignmentConfig {
            vector_distance_threshold: self.news_vector_distance_threshold,
            vector_filter_by_category: self.news_vector_filter_by_category,
            enhanced_semantic: self.enhanced_semantic_clustering,
            batch_size: self.cluster_batch_size,
            ..AssignmentConfig::default()
        }
    }
}

// =============================================================================
// Env parsing helpers
// =============================================================================

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(key) {
        match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            other => warn!(key, value = other, "unparseable boolean env var ignored"),
        }
    }
}

macro_rules! env_numeric {
    ($name:ident, $ty:ty) => {
        fn $name(key: &str, target: &mut $ty) {
            if let Ok(value) = std::env::var(key) {
                match value.trim().parse::<$ty>() {
                    Ok(parsed) => *target = parsed,
                    Err(_) => warn!(key, value = %value, "unparseable numeric env var ignored"),
                }
            }
        }
    };
}

env_numeric!(env_u64, u64);
env_numeric!(env_u32, u32);
env_numeric!(env_i64, i64);
env_numeric!(env_f64, f64);
env_numeric!(env_usize, usize);
