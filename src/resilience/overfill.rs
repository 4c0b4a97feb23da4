// =============================================================================
// Overfill Protection — reconcile exchange fills against recorded orders
// =============================================================================
//
// The registry tracks every active order and the set of fill ids already
// applied to it. `check_fill` decides what to do with an incoming fill that
// exceeds the order's remaining quantity:
//
//   overfill <= order_qty * tolerance_percent  -> allow as-is
//   allow_overfills                            -> allow, record ALLOWED
//   auto_adjust                                -> clamp to remaining, ADJUSTED
//   otherwise                                  -> reject, record REJECTED
//
// `record_fill` is idempotent per fill id: a duplicate arrival is ignored.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::prediction::model::{Fill, OrderState, OrderStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OverfillConfig {
    /// Overfill allowance as a fraction of order quantity.
    pub tolerance_percent: f64,
    /// Accept any overfill as-is.
    pub allow_overfills: bool,
    /// Clamp overfills down to the remaining quantity.
    pub auto_adjust: bool,
}

impl Default for OverfillConfig {
    fn default() -> Self {
        Self {
            tolerance_percent: 0.01,
            allow_overfills: false,
            auto_adjust: true,
        }
    }
}

/// How an out-of-tolerance overfill was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverfillHandling {
    Allowed,
    Adjusted,
    Rejected,
}

/// Replacement quantities for an adjusted fill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdjustedFill {
    pub qty: f64,
    pub px: f64,
}

/// Outcome of a `check_fill` call.
#[derive(Debug, Clone, Serialize)]
pub struct FillVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub adjusted_fill: Option<AdjustedFill>,
    pub handled: Option<OverfillHandling>,
}

/// Audit record of every out-of-tolerance overfill seen.
#[derive(Debug, Clone, Serialize)]
pub struct HandledOverfill {
    pub order_id: String,
    pub fill_qty: f64,
    pub overfill: f64,
    pub handling: OverfillHandling,
    pub at: String,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct OverfillProtection {
    orders: RwLock<HashMap<String, OrderState>>,
    fill_ids: RwLock<HashMap<String, HashSet<String>>>,
    handled: RwLock<Vec<HandledOverfill>>,
    config: OverfillConfig,
}

impl OverfillProtection {
    pub fn new(config: OverfillConfig) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            fill_ids: RwLock::new(HashMap::new()),
            handled: RwLock::new(Vec::new()),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Track an active order.
    pub fn register_order(&self, order: OrderState) {
        debug!(order_id = %order.order_id, qty = order.order_qty, "order registered");
        self.orders.write().insert(order.order_id.clone(), order);
    }

    /// Stop tracking an order (terminal state reached).
    pub fn unregister_order(&self, order_id: &str) {
        self.orders.write().remove(order_id);
        self.fill_ids.write().remove(order_id);
    }

    pub fn get_order(&self, order_id: &str) -> Option<OrderState> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn active_order_count(&self) -> usize {
        self.orders.read().len()
    }

    /// Out-of-tolerance overfills handled so far (audit trail).
    pub fn handled_overfills(&self) -> Vec<HandledOverfill> {
        self.handled.read().clone()
    }

    // -------------------------------------------------------------------------
    // Fill validation
    // -------------------------------------------------------------------------

    /// Decide whether an incoming fill may be applied to `order_id`.
    pub fn check_fill(&self, order_id: &str, fill_qty: f64, fill_px: f64) -> FillVerdict {
        let orders = self.orders.read();
        let order = match orders.get(order_id) {
            Some(o) => o,
            None => {
                warn!(order_id, "fill rejected — order not found");
                return FillVerdict {
                    allowed: false,
                    reason: Some(format!("Order {order_id} not found")),
                    adjusted_fill: None,
                    handled: None,
                };
            }
        };

        let remaining = order.order_qty - order.filled_qty;
        let overfill = fill_qty - remaining;
        let tolerance = order.order_qty * self.config.tolerance_percent;

        if overfill <= tolerance {
            return FillVerdict {
                allowed: true,
                reason: None,
                adjusted_fill: None,
                handled: None,
            };
        }
        drop(orders);

        if self.config.allow_overfills {
            warn!(order_id, fill_qty, remaining, overfill, "overfill allowed by policy");
            self.record_handled(order_id, fill_qty, overfill, OverfillHandling::Allowed);
            FillVerdict {
                allowed: true,
                reason: Some(format!("Overfill of {overfill:.4} allowed by policy")),
                adjusted_fill: None,
                handled: Some(OverfillHandling::Allowed),
            }
        } else if self.config.auto_adjust {
            info!(
                order_id,
                fill_qty,
                adjusted_qty = remaining,
                "overfill auto-adjusted to remaining quantity"
            );
            self.record_handled(order_id, fill_qty, overfill, OverfillHandling::Adjusted);
            FillVerdict {
                allowed: true,
                reason: Some(format!(
                    "Fill of {fill_qty:.4} adjusted to remaining {remaining:.4}"
                )),
                adjusted_fill: Some(AdjustedFill {
                    qty: remaining,
                    px: fill_px,
                }),
                handled: Some(OverfillHandling::Adjusted),
            }
        } else {
            warn!(order_id, fill_qty, remaining, overfill, "overfill rejected");
            self.record_handled(order_id, fill_qty, overfill, OverfillHandling::Rejected);
            FillVerdict {
                allowed: false,
                reason: Some(format!(
                    "Overfill of {overfill:.4} exceeds tolerance {tolerance:.4}"
                )),
                adjusted_fill: None,
                handled: Some(OverfillHandling::Rejected),
            }
        }
    }

    /// Apply a fill to its order: update filled quantity, volume-weighted
    /// average price, and flip the status to FILLED when complete. A fill id
    /// seen before is silently ignored.
    ///
    /// Returns `true` if the fill was applied, `false` for duplicates and
    /// unknown orders.
    pub fn record_fill(&self, fill: &Fill) -> bool {
        {
            let mut fill_ids = self.fill_ids.write();
            let seen = fill_ids.entry(fill.order_id.clone()).or_default();
            if !seen.insert(fill.fill_id.clone()) {
                debug!(fill_id = %fill.fill_id, "duplicate fill ignored");
                return false;
            }
        }

        let mut orders = self.orders.write();
        let order = match orders.get_mut(&fill.order_id) {
            Some(o) => o,
            None => {
                warn!(order_id = %fill.order_id, "fill recorded for unknown order — dropped");
                return false;
            }
        };

        let prev_notional = order.avg_px * order.filled_qty;
        order.filled_qty += fill.fill_qty;
        if order.filled_qty > 0.0 {
            order.avg_px = (prev_notional + fill.fill_px * fill.fill_qty) / order.filled_qty;
        }
        if order.filled_qty >= order.order_qty {
            order.status = OrderStatus::Filled;
        }

        debug!(
            order_id = %fill.order_id,
            fill_id = %fill.fill_id,
            filled_qty = order.filled_qty,
            avg_px = order.avg_px,
            status = ?order.status,
            "fill recorded"
        );
        true
    }

    /// Structural checks between a fill and the order it claims to belong to.
    pub fn validate_fill_for_order(&self, fill: &Fill, order_id: &str) -> Result<(), String> {
        let orders = self.orders.read();
        let order = orders
            .get(order_id)
            .ok_or_else(|| format!("Order {order_id} not found"))?;

        let id_matches = fill.order_id == order.order_id
            || order
                .venue_order_id
                .as_deref()
                .map(|v| v == fill.order_id)
                .unwrap_or(false);
        if !id_matches {
            return Err(format!(
                "Fill order id {} does not match order {} / venue order {:?}",
                fill.order_id, order.order_id, order.venue_order_id
            ));
        }
        if fill.symbol != order.market_id {
            return Err(format!(
                "Fill symbol {} does not match order market {}",
                fill.symbol, order.market_id
            ));
        }
        if fill.side != order.side {
            return Err(format!(
                "Fill side {} does not match order side {}",
                fill.side, order.side
            ));
        }
        Ok(())
    }

    fn record_handled(&self, order_id: &str, fill_qty: f64, overfill: f64, handling: OverfillHandling) {
        self.handled.write().push(HandledOverfill {
            order_id: order_id.to_string(),
            fill_qty,
            overfill,
            handling,
            at: Utc::now().to_rfc3339(),
        });
    }
}

impl std::fmt::Debug for OverfillProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverfillProtection")
            .field("active_orders", &self.orders.read().len())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::model::OrderSide;

    fn order(id: &str, qty: f64, filled: f64) -> OrderState {
        OrderState {
            order_id: id.into(),
            client_order_id: format!("c-{id}"),
            venue_order_id: Some(format!("v-{id}")),
            market_id: "mkt-1".into(),
            side: OrderSide::Buy,
            order_qty: qty,
            filled_qty: filled,
            avg_px: 0.0,
            status: OrderStatus::Open,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn fill(fill_id: &str, order_id: &str, qty: f64, px: f64) -> Fill {
        Fill {
            fill_id: fill_id.into(),
            order_id: order_id.into(),
            symbol: "mkt-1".into(),
            side: OrderSide::Buy,
            fill_qty: qty,
            fill_px: px,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn unknown_order_is_rejected() {
        let svc = OverfillProtection::new(OverfillConfig::default());
        let verdict = svc.check_fill("nope", 10.0, 0.5);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason.as_deref(), Some("Order nope not found"));
    }

    #[test]
    fn within_tolerance_allows() {
        let svc = OverfillProtection::new(OverfillConfig::default());
        svc.register_order(order("o-1", 100.0, 90.0));
        // remaining=10, overfill=0.5 <= tolerance=1.0
        let verdict = svc.check_fill("o-1", 10.5, 0.5);
        assert!(verdict.allowed);
        assert!(verdict.handled.is_none());
    }

    #[test]
    fn overfill_auto_adjusts_to_remaining() {
        let svc = OverfillProtection::new(OverfillConfig {
            tolerance_percent: 0.01,
            allow_overfills: false,
            auto_adjust: true,
        });
        svc.register_order(order("o-1", 100.0, 90.0));

        // remaining=10, fill=15 => overfill=5 > tolerance
        let verdict = svc.check_fill("o-1", 15.0, 0.42);
        assert!(verdict.allowed);
        assert_eq!(verdict.handled, Some(OverfillHandling::Adjusted));
        let adjusted = verdict.adjusted_fill.unwrap();
        assert!((adjusted.qty - 10.0).abs() < f64::EPSILON);
        assert!((adjusted.px - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn overfill_rejected_without_policies() {
        let svc = OverfillProtection::new(OverfillConfig {
            tolerance_percent: 0.01,
            allow_overfills: false,
            auto_adjust: false,
        });
        svc.register_order(order("o-1", 100.0, 90.0));

        let verdict = svc.check_fill("o-1", 15.0, 0.42);
        assert!(!verdict.allowed);
        assert_eq!(verdict.handled, Some(OverfillHandling::Rejected));
        assert_eq!(svc.handled_overfills().len(), 1);
    }

    #[test]
    fn overfill_allowed_by_policy() {
        let svc = OverfillProtection::new(OverfillConfig {
            tolerance_percent: 0.01,
            allow_overfills: true,
            auto_adjust: false,
        });
        svc.register_order(order("o-1", 100.0, 90.0));

        let verdict = svc.check_fill("o-1", 15.0, 0.42);
        assert!(verdict.allowed);
        assert_eq!(verdict.handled, Some(OverfillHandling::Allowed));
    }

    #[test]
    fn duplicate_fill_is_ignored() {
        let svc = OverfillProtection::new(OverfillConfig::default());
        svc.register_order(order("o-1", 100.0, 0.0));

        assert!(svc.record_fill(&fill("f-1", "o-1", 40.0, 0.50)));
        assert!(!svc.record_fill(&fill("f-1", "o-1", 40.0, 0.50)));

        let stored = svc.get_order("o-1").unwrap();
        assert!((stored.filled_qty - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn record_fill_updates_vwap_and_status() {
        let svc = OverfillProtection::new(OverfillConfig::default());
        svc.register_order(order("o-1", 100.0, 0.0));

        svc.record_fill(&fill("f-1", "o-1", 60.0, 0.50));
        svc.record_fill(&fill("f-2", "o-1", 40.0, 0.60));

        let stored = svc.get_order("o-1").unwrap();
        assert!((stored.filled_qty - 100.0).abs() < f64::EPSILON);
        // VWAP = (60*0.5 + 40*0.6) / 100 = 0.54
        assert!((stored.avg_px - 0.54).abs() < 1e-9);
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    #[test]
    fn validate_fill_checks_ids_symbol_side() {
        let svc = OverfillProtection::new(OverfillConfig::default());
        svc.register_order(order("o-1", 100.0, 0.0));

        assert!(svc
            .validate_fill_for_order(&fill("f-1", "o-1", 10.0, 0.5), "o-1")
            .is_ok());

        // Venue order id also matches.
        assert!(svc
            .validate_fill_for_order(&fill("f-2", "v-o-1", 10.0, 0.5), "o-1")
            .is_ok());

        let mut bad_symbol = fill("f-3", "o-1", 10.0, 0.5);
        bad_symbol.symbol = "mkt-2".into();
        assert!(svc.validate_fill_for_order(&bad_symbol, "o-1").is_err());

        let mut bad_side = fill("f-4", "o-1", 10.0, 0.5);
        bad_side.side = OrderSide::Sell;
        assert!(svc.validate_fill_for_order(&bad_side, "o-1").is_err());

        assert!(svc
            .validate_fill_for_order(&fill("f-5", "o-9", 10.0, 0.5), "o-9")
            .is_err());
    }
}
