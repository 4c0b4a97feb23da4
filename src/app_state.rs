// =============================================================================
// Central Application State — Argus Intelligence Engine
// =============================================================================
//
// The single wiring module: constructs and owns every process-wide singleton
// (message bus, breaker registry, rate limiter, HTTP client, cluster/vector
// stores, both pipeline orchestrators, risk manager, execution engine,
// snapshot service) and ties them together behind `Arc<AppState>`.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Duration;

use crate::bus::MessageBus;
use crate::news::assignment::ClusterAssignmentEngine;
use crate::news::entities::EntityExtractor;
use crate::news::gate::IngestionGate;
use crate::news::llm::{DisabledLlmClient, FallbackLlmClient, HttpLlmClient, LlmClient};
use crate::news::merger::ClusterMerger;
use crate::news::orchestrator::{HttpNewsSource, NewsOrchestrator};
use crate::news::similarity::SemanticSimilarityService;
use crate::news::store::{InMemoryClusterStore, StoryClusterStore};
use crate::news::vector::{HashingEmbedder, InMemoryVectorStore};
use crate::prediction::execution::PredictionExecutionEngine;
use crate::prediction::model::DailyRiskState;
use crate::prediction::nodes::{
    BacktesterNode, IdeaSelector, MarketDataNode, NewsContextNode, TheorizerNode,
};
use crate::prediction::orchestrator::PredictionOrchestrator;
use crate::prediction::reconcile::{PositionReconciler, ReconcileConfig};
use crate::prediction::risk::{JsonDailyStateStore, RiskManager};
use crate::prediction::venue::{HttpPredictionVenue, PaperVenue, PredictionVenue};
use crate::resilience::circuit::{CircuitBreakerRegistry, HealthSummary};
use crate::resilience::http::{HttpClientConfig, ResilientHttpClient};
use crate::resilience::overfill::{OverfillConfig, OverfillProtection};
use crate::resilience::rate_limit::{DualBucketRateLimiter, RateLimiterSnapshot};
use crate::resilience::snapshot::SnapshotService;
use crate::runtime_config::RuntimeConfig;
use crate::types::AccountMode;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors retained.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Monotonically increasing version counter; the WebSocket feed uses it
    /// to detect changes.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Shared runtime ──────────────────────────────────────────────────
    pub bus: Arc<MessageBus>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<DualBucketRateLimiter>,
    pub http: Arc<ResilientHttpClient>,
    pub overfill: Arc<OverfillProtection>,
    pub snapshots: Arc<SnapshotService>,

    // ── News pipeline ───────────────────────────────────────────────────
    pub cluster_store: Arc<InMemoryClusterStore>,
    pub vector_store: Arc<InMemoryVectorStore>,
    pub news: Arc<NewsOrchestrator>,

    // ── Prediction pipeline ─────────────────────────────────────────────
    pub risk: Arc<RiskManager>,
    pub engine: Arc<PredictionExecutionEngine>,
    pub prediction: Arc<PredictionOrchestrator>,

    // ── Error log & timing ──────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full engine from the runtime configuration. This is the
    /// only place the process-wide singletons are created.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(MessageBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60)));
        let limiter = Arc::new(DualBucketRateLimiter::with_defaults());

        let http = Arc::new(ResilientHttpClient::new(
            breakers.clone(),
            limiter.clone(),
            HttpClientConfig {
                count_client_errors_as_failures: config.count_client_errors_as_failures,
                ..HttpClientConfig::default()
            },
            "venue-info",
        )?);

        // ── LLM seam ────────────────────────────────────────────────────
        let llm: Arc<dyn LlmClient> = if config.llm_endpoint.is_empty() {
            Arc::new(DisabledLlmClient)
        } else {
            let primary: Arc<dyn LlmClient> =
                Arc::new(HttpLlmClient::new(http.clone(), config.llm_endpoint.clone()));
            let glm_endpoint = std::env::var("ARGUS_GLM_ENDPOINT").unwrap_or_default();
            if config.news_use_glm && !glm_endpoint.is_empty() {
                Arc::new(FallbackLlmClient::new(
                    primary,
                    Arc::new(HttpLlmClient::new(http.clone(), glm_endpoint)),
                ))
            } else {
                primary
            }
        };

        // ── News pipeline ───────────────────────────────────────────────
        let cluster_store = Arc::new(InMemoryClusterStore::new());
        let vector_store = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(HashingEmbedder::default());
        let similarity = Arc::new(SemanticSimilarityService::new(embedder, llm.clone()));
        let extractor = Arc::new(EntityExtractor::new(llm.clone()));

        let assignment = Arc::new(ClusterAssignmentEngine::new(
            cluster_store.clone(),
            vector_store.clone(),
            similarity,
            config.assignment_config(),
        ));
        let merger = Arc::new(ClusterMerger::new(
            cluster_store.clone(),
            chrono::Duration::hours(48),
        ));

        let news_source = Arc::new(HttpNewsSource::new(
            http.clone(),
            std::env::var("ARGUS_NEWS_SOURCE_URL").unwrap_or_default(),
        ));
        let news = Arc::new(NewsOrchestrator::new(
            news_source,
            IngestionGate::default(),
            llm.clone(),
            extractor,
            assignment,
            merger,
            cluster_store.clone(),
            breakers.clone(),
            bus.clone(),
            config.news_config(),
        ));

        // ── Prediction pipeline ─────────────────────────────────────────
        let risk = Arc::new(RiskManager::new(
            config.risk_limits(),
            Box::new(JsonDailyStateStore::new("daily_risk_state.json")),
        ));
        let overfill = Arc::new(OverfillProtection::new(OverfillConfig::default()));

        let venue: Arc<dyn PredictionVenue> = match config.account_mode {
            AccountMode::Paper => Arc::new(PaperVenue::new()),
            AccountMode::Live => Arc::new(HttpPredictionVenue::new(
                http.clone(),
                config.polymarket_api_base.clone(),
                config.polymarket_clob_base.clone(),
                std::env::var("POLYMARKET_API_KEY").unwrap_or_default(),
                std::env::var("POLYMARKET_API_SECRET").unwrap_or_default(),
            )),
        };

        let engine = Arc::new(PredictionExecutionEngine::new(
            config.account_mode,
            config.execution_config(),
            risk.clone(),
            overfill.clone(),
            venue.clone(),
            bus.clone(),
        ));

        let snapshots = Arc::new(SnapshotService::new(
            engine.clone(),
            64,
            chrono::Duration::hours(24),
        ));

        let reconciler = Arc::new(PositionReconciler::new(
            engine.clone(),
            venue.clone(),
            risk.clone(),
            bus.clone(),
            ReconcileConfig {
                auto_close_orphans: config.reconcile_auto_close_orphans,
                ..ReconcileConfig::default()
            },
        ));

        let prediction = Arc::new(PredictionOrchestrator::new(
            MarketDataNode::new(
                venue,
                engine.clone(),
                config.prediction_min_market_volume,
                25,
            ),
            NewsContextNode::new(cluster_store.clone()),
            TheorizerNode::new(0.02),
            BacktesterNode::new(0.3, 5),
            IdeaSelector::new(0.02, 0.55),
            risk.clone(),
            engine.clone(),
            reconciler,
            snapshots.clone(),
            bus.clone(),
        ));

        Ok(Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            bus,
            breakers,
            limiter,
            http,
            overfill,
            snapshots,
            cluster_store,
            vector_store,
            news,
            risk,
            engine,
            prediction,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Increment the state version after any meaningful mutation.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message; the ring is capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Full serialisable snapshot of the engine for the dashboard REST and
    /// WebSocket surfaces.
    pub async fn build_status_snapshot(&self) -> StatusSnapshot {
        let config = self.runtime_config.read().clone();
        let hot_clusters = self
            .cluster_store
            .hottest_clusters(10)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|c| HotClusterSummary {
                cluster_id: c.id,
                topic: c.topic,
                category: c.category,
                heat_score: c.heat_score,
                article_count: c.article_count,
            })
            .collect();

        StatusSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            engine_mode: config.engine_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            health: self.breakers.health_summary(),
            http_health: self.http.health(),
            rate_limits: self.limiter.snapshot(),
            portfolio: PortfolioView::from(self.engine.portfolio()),
            positions: self.engine.positions().len(),
            pending_orders: self.engine.pending_orders().len(),
            daily_risk: self.risk.daily_state(),
            agent_status: self
                .prediction
                .current_status()
                .map(|s| format!("{}: {}", s.agent, s.current_step)),
            hot_clusters,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HotClusterSummary {
    pub cluster_id: String,
    pub topic: String,
    pub category: String,
    pub heat_score: f64,
    pub article_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub total_value: f64,
    pub available_balance: f64,
    pub used_balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub position_count: usize,
}

impl From<crate::prediction::model::Portfolio> for PortfolioView {
    fn from(p: crate::prediction::model::Portfolio) -> Self {
        Self {
            total_value: p.total_value,
            available_balance: p.available_balance,
            used_balance: p.used_balance,
            realized_pnl: p.realized_pnl,
            unrealized_pnl: p.unrealized_pnl,
            position_count: p.position_count,
        }
    }
}

/// Full engine status snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub engine_mode: String,
    pub account_mode: String,
    pub health: HealthSummary,
    pub http_health: crate::resilience::http::HttpHealth,
    pub rate_limits: RateLimiterSnapshot,
    pub portfolio: PortfolioView,
    pub positions: usize,
    pub pending_orders: usize,
    pub daily_risk: DailyRiskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<String>,
    pub hot_clusters: Vec<HotClusterSummary>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_state_wires_up_from_default_config() {
        let state = AppState::new(RuntimeConfig::default()).unwrap();
        assert_eq!(state.current_state_version(), 1);

        let snapshot = state.build_status_snapshot().await;
        assert_eq!(snapshot.engine_mode, "Paused");
        assert_eq!(snapshot.account_mode, "Paper");
        assert!((snapshot.portfolio.available_balance - 10_000.0).abs() < f64::EPSILON);
        assert!(snapshot.hot_clusters.is_empty());
    }

    #[tokio::test]
    async fn error_ring_is_capped() {
        let state = AppState::new(RuntimeConfig::default()).unwrap();
        for i in 0..60 {
            state.push_error(format!("error {i}"), None);
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "error 59");
    }
}
