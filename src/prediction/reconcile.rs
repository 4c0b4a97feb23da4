// =============================================================================
// Position Reconciler — compare book-keeping against the venue
// =============================================================================
//
// SAFETY POLICY: the reconciler logs and reports drift but never touches the
// venue. Orphaned book positions are auto-closed locally only when the
// `auto_close_orphans` switch is set; otherwise a human resolves them. A
// CRITICAL discrepancy can trigger the emergency stop when configured.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{Channel, MessageBus};

use super::execution::PredictionExecutionEngine;
use super::risk::RiskManager;
use super::venue::PredictionVenue;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DiscrepancySeverity {
    Minor,
    Major,
    Critical,
}

/// One share-count mismatch between the book and the venue.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub symbol: String,
    pub expected_shares: f64,
    pub actual_shares: f64,
    pub deviation_pct: f64,
    pub severity: DiscrepancySeverity,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub discrepancies: Vec<Discrepancy>,
    /// Book positions with no matching venue position.
    pub orphaned: Vec<String>,
    /// Positions whose price has not updated within the staleness window.
    pub stale: Vec<String>,
    pub venue_position_count: usize,
    pub book_position_count: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Relative share deviation below which positions are considered matched.
    pub tolerance: f64,
    /// Price age beyond which a position counts as stale.
    pub staleness: chrono::Duration,
    /// Close orphaned book positions locally without human confirmation.
    pub auto_close_orphans: bool,
    /// Trip the emergency stop on a CRITICAL discrepancy.
    pub emergency_stop_on_critical: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            staleness: chrono::Duration::minutes(15),
            auto_close_orphans: false,
            emergency_stop_on_critical: true,
        }
    }
}

/// Deviation above which a discrepancy is CRITICAL.
const CRITICAL_DEVIATION: f64 = 0.10;
/// Deviation above which a discrepancy is MAJOR.
const MAJOR_DEVIATION: f64 = 0.01;

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct PositionReconciler {
    engine: Arc<PredictionExecutionEngine>,
    venue: Arc<dyn PredictionVenue>,
    risk: Arc<RiskManager>,
    bus: Arc<MessageBus>,
    config: ReconcileConfig,
}

impl PositionReconciler {
    pub fn new(
        engine: Arc<PredictionExecutionEngine>,
        venue: Arc<dyn PredictionVenue>,
        risk: Arc<RiskManager>,
        bus: Arc<MessageBus>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            engine,
            venue,
            risk,
            bus,
            config,
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> anyhow::Result<ReconciliationResult> {
        let now = Utc::now().to_rfc3339();
        info!(timestamp = %now, "reconciliation cycle started");

        let venue_positions = self
            .venue
            .fetch_positions()
            .await
            .context("reconcile: failed to fetch venue positions")?;

        // Venue shares per symbol.
        let venue_map: HashMap<String, f64> = venue_positions
            .iter()
            .map(|p| (p.symbol.clone(), p.shares))
            .fold(HashMap::new(), |mut acc, (symbol, shares)| {
                *acc.entry(symbol).or_insert(0.0) += shares;
                acc
            });

        // Book shares per market (outcomes aggregated per symbol).
        let book_positions = self.engine.positions();
        let mut book_map: HashMap<String, f64> = HashMap::new();
        for position in &book_positions {
            *book_map.entry(position.market_id.clone()).or_insert(0.0) += position.shares;
        }

        let mut discrepancies = Vec::new();
        let mut orphaned = Vec::new();

        for (symbol, expected) in &book_map {
            match venue_map.get(symbol) {
                Some(actual) => {
                    let deviation = if *expected > 0.0 {
                        (actual - expected).abs() / expected
                    } else {
                        0.0
                    };
                    if deviation > self.config.tolerance {
                        let severity = if deviation > CRITICAL_DEVIATION {
                            DiscrepancySeverity::Critical
                        } else if deviation > MAJOR_DEVIATION {
                            DiscrepancySeverity::Major
                        } else {
                            DiscrepancySeverity::Minor
                        };
                        warn!(
                            symbol = %symbol,
                            expected,
                            actual,
                            deviation_pct = deviation * 100.0,
                            severity = ?severity,
                            "position discrepancy detected"
                        );
                        discrepancies.push(Discrepancy {
                            symbol: symbol.clone(),
                            expected_shares: *expected,
                            actual_shares: *actual,
                            deviation_pct: deviation,
                            severity,
                        });
                    } else {
                        debug!(symbol = %symbol, "position matched with venue");
                    }
                }
                None => {
                    warn!(symbol = %symbol, "book position has NO matching venue position");
                    orphaned.push(symbol.clone());
                }
            }
        }

        // Staleness: positions whose price is older than the window.
        let stale = self.engine.stale_markets(self.config.staleness);
        for symbol in &stale {
            warn!(symbol = %symbol, "position price is stale");
        }

        let result = ReconciliationResult {
            discrepancies,
            orphaned,
            stale,
            venue_position_count: venue_positions.len(),
            book_position_count: book_positions.len(),
            timestamp: now,
        };

        self.act_on(&result);

        info!(
            discrepancies = result.discrepancies.len(),
            orphaned = result.orphaned.len(),
            stale = result.stale.len(),
            "reconciliation cycle completed"
        );
        Ok(result)
    }

    /// Policy reactions to a reconciliation result.
    fn act_on(&self, result: &ReconciliationResult) {
        let critical = result
            .discrepancies
            .iter()
            .any(|d| d.severity == DiscrepancySeverity::Critical);
        if critical && self.config.emergency_stop_on_critical {
            self.risk
                .trigger_emergency_stop("critical position discrepancy");
            self.bus.publish(
                Channel::EmergencyStop,
                serde_json::json!({
                    "source": "reconciler",
                    "reason": "critical position discrepancy",
                }),
            );
        }

        if self.config.auto_close_orphans && !result.orphaned.is_empty() {
            warn!(
                count = result.orphaned.len(),
                "auto-closing orphaned book positions"
            );
            self.engine.close_markets_locally(&result.orphaned);
        }

        if !result.discrepancies.is_empty() || !result.orphaned.is_empty() {
            self.bus.publish(
                Channel::Error,
                serde_json::json!({
                    "source": "reconciler",
                    "discrepancies": result.discrepancies.len(),
                    "orphaned": result.orphaned.len(),
                }),
            );
        }
    }

    /// Spawn the periodic reconciliation loop.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile_once().await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for PositionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionReconciler")
            .field("config", &self.config)
            .finish()
    }
}
