// =============================================================================
// Pipeline Nodes — market data, news context, theorizer, backtester, selector
// =============================================================================
//
// Each node is one stage of the prediction cycle. The theorizer is a
// deterministic heuristic over news heat and sentiment; an LLM can refine it
// but is never required.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::news::model::{StoryCluster, TrendDirection};
use crate::news::store::StoryClusterStore;

use super::execution::PredictionExecutionEngine;
use super::model::{Outcome, PredictionIdea, PredictionMarket, Trade};
use super::venue::PredictionVenue;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

pub struct MarketDataNode {
    venue: Arc<dyn PredictionVenue>,
    engine: Arc<PredictionExecutionEngine>,
    min_volume: f64,
    market_limit: usize,
}

impl MarketDataNode {
    pub fn new(
        venue: Arc<dyn PredictionVenue>,
        engine: Arc<PredictionExecutionEngine>,
        min_volume: f64,
        market_limit: usize,
    ) -> Self {
        Self {
            venue,
            engine,
            min_volume,
            market_limit,
        }
    }

    /// Fetch tradable markets and refresh the engine's price cache.
    pub async fn fetch(&self) -> anyhow::Result<Vec<PredictionMarket>> {
        let now = Utc::now();
        let markets: Vec<PredictionMarket> = self
            .venue
            .fetch_markets(self.market_limit * 2)
            .await?
            .into_iter()
            .filter(|m| m.volume >= self.min_volume)
            .filter(|m| m.open_until.map(|until| until > now).unwrap_or(true))
            .filter(|m| m.last_yes_price > 0.0 && m.last_yes_price < 1.0)
            .take(self.market_limit)
            .collect();

        for market in &markets {
            self.engine
                .update_market_price(&market.market_id, market.last_yes_price, market.last_no_price);
        }

        debug!(count = markets.len(), "markets fetched and prices refreshed");
        Ok(markets)
    }
}

// ---------------------------------------------------------------------------
// News context
// ---------------------------------------------------------------------------

/// Aggregated news intelligence for one market.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketIntel {
    pub heat_score: f64,
    /// In [-1, 1]: positive when linked clusters trend UP.
    pub sentiment_score: f64,
    pub linked_news_count: u32,
    pub linked_cluster_count: u32,
    pub top_topic: Option<String>,
}

/// News context for one cycle.
#[derive(Debug, Clone, Default)]
pub struct NewsContext {
    pub hot_clusters: Vec<StoryCluster>,
    pub market_intel: HashMap<String, MarketIntel>,
}

pub struct NewsContextNode {
    store: Arc<dyn StoryClusterStore>,
}

/// Hot clusters pulled per cycle.
const HOT_CLUSTER_LIMIT: usize = 20;
/// Long words a market title must share with a cluster topic to link them.
const LINK_WORD_OVERLAP: usize = 2;

impl NewsContextNode {
    pub fn new(store: Arc<dyn StoryClusterStore>) -> Self {
        Self { store }
    }

    /// Link hot clusters to markets by title/topic word overlap.
    pub async fn build(&self, markets: &[PredictionMarket]) -> anyhow::Result<NewsContext> {
        let hot_clusters = self.store.hottest_clusters(HOT_CLUSTER_LIMIT).await?;
        let mut market_intel: HashMap<String, MarketIntel> = HashMap::new();

        for market in markets {
            let mut intel = MarketIntel::default();
            let mut top_heat = 0.0;

            for cluster in &hot_clusters {
                if word_overlap(&market.title, &cluster.topic) < LINK_WORD_OVERLAP {
                    continue;
                }
                intel.linked_cluster_count += 1;
                intel.linked_news_count += cluster.article_count;
                intel.heat_score += cluster.heat_score;
                intel.sentiment_score += match cluster.trend_direction {
                    TrendDirection::Up => 0.3,
                    TrendDirection::Down => -0.3,
                    TrendDirection::Neutral => 0.0,
                };
                if cluster.heat_score > top_heat {
                    top_heat = cluster.heat_score;
                    intel.top_topic = Some(cluster.topic.clone());
                }
            }

            if intel.linked_cluster_count > 0 {
                intel.sentiment_score =
                    (intel.sentiment_score / intel.linked_cluster_count as f64).clamp(-1.0, 1.0);
                market_intel.insert(market.market_id.clone(), intel);
            }
        }

        debug!(
            hot_clusters = hot_clusters.len(),
            covered_markets = market_intel.len(),
            "news context built"
        );
        Ok(NewsContext {
            hot_clusters,
            market_intel,
        })
    }
}

/// Words longer than 3 chars shared between two strings.
fn word_overlap(a: &str, b: &str) -> usize {
    let set_a: std::collections::HashSet<String> = a
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(String::from)
        .collect();
    b.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3 && set_a.contains(*w))
        .count()
}

// ---------------------------------------------------------------------------
// Theorizer
// ---------------------------------------------------------------------------

pub struct TheorizerNode {
    /// Minimum absolute edge for an idea to be worth recording.
    min_edge: f64,
}

/// Heat at which the sentiment shift saturates.
const HEAT_SATURATION: f64 = 50.0;

impl TheorizerNode {
    pub fn new(min_edge: f64) -> Self {
        Self { min_edge }
    }

    /// Generate trade ideas from markets with news coverage. The model: news
    /// sentiment shifts the fair YES price away from the market price in
    /// proportion to heat, and the gap is the edge.
    pub fn theorize(&self, markets: &[PredictionMarket], context: &NewsContext) -> Vec<PredictionIdea> {
        let mut ideas = Vec::new();

        for market in markets {
            let intel = match context.market_intel.get(&market.market_id) {
                Some(i) => i,
                None => continue,
            };

            let heat_factor = (intel.heat_score / HEAT_SATURATION).min(1.0);
            let fair_yes = (market.last_yes_price + intel.sentiment_score * 0.1 * heat_factor)
                .clamp(0.01, 0.99);
            let yes_edge = fair_yes - market.last_yes_price;

            if yes_edge.abs() < self.min_edge {
                continue;
            }

            // Positive edge: YES is cheap. Negative: buy the NO side instead.
            let (outcome, edge, price) = if yes_edge > 0.0 {
                (Outcome::Yes, yes_edge, market.last_yes_price)
            } else {
                ((Outcome::No), -yes_edge, market.last_no_price)
            };

            let confidence = (0.5 + heat_factor * 0.25 + intel.sentiment_score.abs() * 0.3)
                .min(0.95);

            ideas.push(PredictionIdea {
                id: Uuid::new_v4().to_string(),
                market_id: market.market_id.clone(),
                market_title: market.title.clone(),
                outcome,
                edge,
                confidence,
                rationale: format!(
                    "{} linked clusters (heat {:.1}) around '{}'; fair YES {:.2} vs market {:.2} at price {:.2}",
                    intel.linked_cluster_count,
                    intel.heat_score,
                    intel.top_topic.as_deref().unwrap_or("n/a"),
                    fair_yes,
                    market.last_yes_price,
                    price,
                ),
                heat_score: intel.heat_score,
                sentiment_score: intel.sentiment_score,
                linked_news_count: intel.linked_news_count,
                linked_cluster_count: intel.linked_cluster_count,
                time_horizon: "24h".to_string(),
            });
        }

        info!(markets = markets.len(), ideas = ideas.len(), "theorizer pass complete");
        ideas
    }
}

// ---------------------------------------------------------------------------
// Backtester
// ---------------------------------------------------------------------------

/// Historical performance summary applied to an idea.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub win_rate: f64,
    pub samples: u32,
}

pub struct BacktesterNode {
    /// Ideas are dropped when history this deep shows a win rate below this.
    min_win_rate: f64,
    min_samples: u32,
}

impl BacktesterNode {
    pub fn new(min_win_rate: f64, min_samples: u32) -> Self {
        Self {
            min_win_rate,
            min_samples,
        }
    }

    /// Gate ideas against realized trade history and fold the win rate into
    /// the confidence.
    pub fn backtest(
        &self,
        ideas: Vec<PredictionIdea>,
        history: &[Trade],
    ) -> Vec<(PredictionIdea, BacktestResult)> {
        let closing: Vec<&Trade> = history.iter().filter(|t| t.pnl != 0.0).collect();
        let wins = closing.iter().filter(|t| t.pnl > 0.0).count() as u32;
        let samples = closing.len() as u32;
        let win_rate = if samples > 0 {
            wins as f64 / samples as f64
        } else {
            0.5
        };

        ideas
            .into_iter()
            .filter_map(|mut idea| {
                if samples >= self.min_samples && win_rate < self.min_win_rate {
                    debug!(
                        market_id = %idea.market_id,
                        win_rate,
                        samples,
                        "idea dropped by backtest gate"
                    );
                    return None;
                }
                // Blend history into confidence: neutral at 50 % win rate.
                idea.confidence = (idea.confidence * (0.5 + win_rate * 0.5)).min(0.95);
                Some((
                    idea,
                    BacktestResult {
                        win_rate,
                        samples,
                    },
                ))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

pub struct IdeaSelector {
    min_edge: f64,
    min_confidence: f64,
}

impl IdeaSelector {
    pub fn new(min_edge: f64, min_confidence: f64) -> Self {
        Self {
            min_edge,
            min_confidence,
        }
    }

    /// Best idea by edge * confidence, above both floors.
    pub fn select(&self, ideas: &[PredictionIdea]) -> Option<PredictionIdea> {
        ideas
            .iter()
            .filter(|i| i.edge.abs() >= self.min_edge && i.confidence >= self.min_confidence)
            .max_by(|a, b| {
                (a.edge.abs() * a.confidence)
                    .partial_cmp(&(b.edge.abs() * b.confidence))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::model::Urgency;
    use crate::prediction::model::OrderSide;

    fn market(id: &str, title: &str, yes: f64, volume: f64) -> PredictionMarket {
        PredictionMarket {
            market_id: id.into(),
            title: title.into(),
            outcomes: vec!["YES".into(), "NO".into()],
            last_yes_price: yes,
            last_no_price: 1.0 - yes,
            volume,
            open_until: None,
        }
    }

    fn cluster(topic: &str, heat: f64, trend: TrendDirection) -> StoryCluster {
        let now = Utc::now();
        StoryCluster {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            topic_key: crate::news::model::topic_key(topic),
            summary: String::new(),
            category: "MACRO".into(),
            keywords: vec![],
            heat_score: heat,
            article_count: 5,
            unique_title_count: 4,
            trend_direction: trend,
            urgency: Urgency::High,
            sub_event_type: None,
            first_seen: now,
            updated_at: now,
        }
    }

    fn context_for(markets: &[PredictionMarket], clusters: Vec<StoryCluster>) -> NewsContext {
        // Mirror NewsContextNode::build without a store.
        let mut market_intel = HashMap::new();
        for market in markets {
            let mut intel = MarketIntel::default();
            let mut top_heat = 0.0;
            for c in &clusters {
                if word_overlap(&market.title, &c.topic) < LINK_WORD_OVERLAP {
                    continue;
                }
                intel.linked_cluster_count += 1;
                intel.linked_news_count += c.article_count;
                intel.heat_score += c.heat_score;
                intel.sentiment_score += match c.trend_direction {
                    TrendDirection::Up => 0.3,
                    TrendDirection::Down => -0.3,
                    TrendDirection::Neutral => 0.0,
                };
                if c.heat_score > top_heat {
                    top_heat = c.heat_score;
                    intel.top_topic = Some(c.topic.clone());
                }
            }
            if intel.linked_cluster_count > 0 {
                intel.sentiment_score =
                    (intel.sentiment_score / intel.linked_cluster_count as f64).clamp(-1.0, 1.0);
                market_intel.insert(market.market_id.clone(), intel);
            }
        }
        NewsContext {
            hot_clusters: clusters,
            market_intel,
        }
    }

    #[test]
    fn theorizer_buys_yes_on_hot_positive_news() {
        let markets = vec![market("m-1", "Will the Federal Reserve cut interest rates", 0.40, 10_000.0)];
        let context = context_for(
            &markets,
            vec![cluster("Federal Reserve Signals Interest Rate Cut", 60.0, TrendDirection::Up)],
        );

        let ideas = TheorizerNode::new(0.01).theorize(&markets, &context);
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].outcome, Outcome::Yes);
        assert!(ideas[0].edge > 0.0);
        assert!(ideas[0].confidence > 0.5);
        assert_eq!(ideas[0].market_title, "Will the Federal Reserve cut interest rates");
    }

    #[test]
    fn theorizer_flips_to_no_on_negative_sentiment() {
        let markets = vec![market("m-1", "Will the Federal Reserve cut interest rates", 0.40, 10_000.0)];
        let context = context_for(
            &markets,
            vec![cluster("Federal Reserve Rules Out Interest Rate Cut", 60.0, TrendDirection::Down)],
        );

        let ideas = TheorizerNode::new(0.01).theorize(&markets, &context);
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].outcome, Outcome::No);
        assert!(ideas[0].edge > 0.0);
    }

    #[test]
    fn theorizer_skips_uncovered_markets() {
        let markets = vec![market("m-1", "Will it rain in Paris tomorrow", 0.40, 10_000.0)];
        let context = context_for(
            &markets,
            vec![cluster("Nvidia Earnings Beat Estimates", 60.0, TrendDirection::Up)],
        );
        assert!(TheorizerNode::new(0.01).theorize(&markets, &context).is_empty());
    }

    fn trade(pnl: f64) -> Trade {
        Trade {
            trade_id: Uuid::new_v4().to_string(),
            market_id: "m-x".into(),
            outcome: Outcome::Yes,
            side: OrderSide::Sell,
            shares: 10.0,
            price: 0.5,
            fee: 0.0,
            pnl,
            reason: "history".into(),
            executed_at: Utc::now().to_rfc3339(),
        }
    }

    fn idea(edge: f64, confidence: f64) -> PredictionIdea {
        PredictionIdea {
            id: Uuid::new_v4().to_string(),
            market_id: "m-1".into(),
            market_title: "Will it happen".into(),
            outcome: Outcome::Yes,
            edge,
            confidence,
            rationale: String::new(),
            heat_score: 10.0,
            sentiment_score: 0.3,
            linked_news_count: 3,
            linked_cluster_count: 1,
            time_horizon: "24h".into(),
        }
    }

    #[test]
    fn backtester_gates_on_losing_history() {
        let node = BacktesterNode::new(0.3, 5);
        let losing: Vec<Trade> = (0..6).map(|_| trade(-1.0)).collect();
        assert!(node.backtest(vec![idea(0.1, 0.8)], &losing).is_empty());

        // Thin history: the gate does not fire.
        let thin: Vec<Trade> = (0..2).map(|_| trade(-1.0)).collect();
        assert_eq!(node.backtest(vec![idea(0.1, 0.8)], &thin).len(), 1);
    }

    #[test]
    fn backtester_blends_win_rate_into_confidence() {
        let node = BacktesterNode::new(0.3, 5);
        let mixed: Vec<Trade> = (0..10)
            .map(|i| trade(if i < 8 { 1.0 } else { -1.0 }))
            .collect();
        let out = node.backtest(vec![idea(0.1, 0.8)], &mixed);
        assert_eq!(out.len(), 1);
        // win_rate 0.8 -> confidence 0.8 * 0.9 = 0.72.
        assert!((out[0].0.confidence - 0.72).abs() < 1e-9);
        assert!((out[0].1.win_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn selector_picks_best_scoring_idea() {
        let selector = IdeaSelector::new(0.03, 0.55);
        let ideas = vec![idea(0.04, 0.6), idea(0.10, 0.8), idea(0.50, 0.4)];
        let best = selector.select(&ideas).unwrap();
        // Highest edge*confidence among those above both floors.
        assert!((best.edge - 0.10).abs() < 1e-9);

        assert!(selector.select(&[idea(0.01, 0.9)]).is_none());
    }

    #[tokio::test]
    async fn market_data_node_filters_and_prices() {
        use crate::prediction::execution::{ExecutionConfig, PredictionExecutionEngine};
        use crate::prediction::risk::{MemoryDailyStateStore, RiskLimits, RiskManager};
        use crate::prediction::venue::PaperVenue;
        use crate::resilience::overfill::{OverfillConfig, OverfillProtection};
        use crate::types::AccountMode;

        let venue = Arc::new(PaperVenue::new());
        venue.set_markets(vec![
            market("m-1", "Liquid market", 0.5, 10_000.0),
            market("m-2", "Illiquid market", 0.5, 10.0),
        ]);

        let engine = Arc::new(PredictionExecutionEngine::new(
            AccountMode::Paper,
            ExecutionConfig::default(),
            Arc::new(RiskManager::new(
                RiskLimits::default(),
                Box::new(MemoryDailyStateStore::default()),
            )),
            Arc::new(OverfillProtection::new(OverfillConfig::default())),
            venue.clone(),
            Arc::new(crate::bus::MessageBus::new()),
        ));

        let node = MarketDataNode::new(venue, engine, 1_000.0, 10);
        let markets = node.fetch().await.unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].market_id, "m-1");
    }
}
