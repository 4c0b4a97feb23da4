// =============================================================================
// Snapshot Service — point-in-time copies of orders / positions / portfolio
// =============================================================================
//
// Snapshots are deep copies taken behind the source's read guards, kept in
// memory up to `max_in_memory` and pruned past `retention`. Two snapshots can
// be diffed into added/removed/changed sets; diff(a, b) is deterministic and
// reversible via diff(b, a).
//
// Restore returns the stored snapshot for the owning engine to apply;
// application is keyed (order_id / market+outcome), so re-applying the same
// snapshot is a no-op.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::prediction::model::{OrderState, Portfolio, PredictionPosition};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    Full,
    Incremental,
    CycleComplete,
    Manual,
}

impl std::fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Full => "FULL",
            Self::Incremental => "INCREMENTAL",
            Self::CycleComplete => "CYCLE_COMPLETE",
            Self::Manual => "MANUAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cycle_id: Option<String>,
    pub kind: SnapshotType,
}

/// One immutable point-in-time copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub orders: Vec<OrderState>,
    pub positions: Vec<PredictionPosition>,
    #[serde(default)]
    pub portfolio: Option<Portfolio>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Added/removed/changed sets for one entity kind.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    /// (before, after) pairs for entities present in both snapshots whose
    /// compared fields differ.
    pub changed: Vec<(T, T)>,
}

/// Full diff between two snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDiff {
    pub orders: EntityDiff<OrderState>,
    pub positions: EntityDiff<PredictionPosition>,
}

/// Read-only view of the live trading state. Implemented by the execution
/// engine; every method returns copies taken behind its read guards.
pub trait SnapshotSource: Send + Sync {
    fn orders(&self) -> Vec<OrderState>;
    fn positions(&self) -> Vec<PredictionPosition>;
    fn portfolio(&self) -> Option<Portfolio>;
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct SnapshotService {
    source: Arc<dyn SnapshotSource>,
    snapshots: RwLock<Vec<Snapshot>>,
    /// Per-entity histories: order_id -> copies, market_id -> copies.
    order_history: RwLock<HashMap<String, Vec<OrderState>>>,
    position_history: RwLock<HashMap<String, Vec<PredictionPosition>>>,
    last_full_at: RwLock<Option<DateTime<Utc>>>,
    max_in_memory: usize,
    retention: chrono::Duration,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SnapshotService {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        max_in_memory: usize,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            source,
            snapshots: RwLock::new(Vec::new()),
            order_history: RwLock::new(HashMap::new()),
            position_history: RwLock::new(HashMap::new()),
            last_full_at: RwLock::new(None),
            max_in_memory,
            retention,
            timer: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Take a snapshot of the current orders, positions, and portfolio.
    pub fn create_snapshot(
        &self,
        kind: SnapshotType,
        cycle_id: Option<String>,
        context: Option<serde_json::Value>,
    ) -> Snapshot {
        let now = Utc::now();
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                id: Uuid::new_v4().to_string(),
                timestamp: now,
                cycle_id,
                kind,
            },
            orders: self.source.orders(),
            positions: self.source.positions(),
            portfolio: self.source.portfolio(),
            context,
        };

        if kind == SnapshotType::Full {
            *self.last_full_at.write() = Some(now);
        }

        info!(
            id = %snapshot.metadata.id,
            kind = %kind,
            orders = snapshot.orders.len(),
            positions = snapshot.positions.len(),
            "snapshot created"
        );

        {
            let mut snapshots = self.snapshots.write();
            snapshots.push(snapshot.clone());
        }
        self.prune(now);

        snapshot
    }

    /// Append a point-in-time copy of one order to its history.
    pub fn snapshot_order(&self, order: &OrderState) {
        self.order_history
            .write()
            .entry(order.order_id.clone())
            .or_default()
            .push(order.clone());
    }

    /// Append a point-in-time copy of one position to its history.
    pub fn snapshot_position(&self, position: &PredictionPosition) {
        self.position_history
            .write()
            .entry(position.market_id.clone())
            .or_default()
            .push(position.clone());
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Find a stored snapshot by id. This is the restore entry point: the
    /// owning engine applies the returned copy through its keyed state, so a
    /// second application of the same snapshot changes nothing.
    pub fn restore_from_snapshot(&self, id: &str) -> Option<Snapshot> {
        let found = self
            .snapshots
            .read()
            .iter()
            .find(|s| s.metadata.id == id)
            .cloned();
        match &found {
            Some(s) => info!(id, kind = %s.metadata.kind, "snapshot located for restore"),
            None => warn!(id, "snapshot not found for restore"),
        }
        found
    }

    /// Most recent snapshot, if any.
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.read().last().cloned()
    }

    /// Timestamp of the last FULL snapshot.
    pub fn last_full_at(&self) -> Option<DateTime<Utc>> {
        *self.last_full_at.read()
    }

    pub fn stored_count(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn order_history(&self, order_id: &str) -> Vec<OrderState> {
        self.order_history
            .read()
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn position_history(&self, market_id: &str) -> Vec<PredictionPosition> {
        self.position_history
            .read()
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Diff
    // -------------------------------------------------------------------------

    /// Diff two snapshots. Orders are "changed" when (filled_qty, status)
    /// differ; positions when their share count differs.
    pub fn compare_snapshots(a: &Snapshot, b: &Snapshot) -> SnapshotDiff {
        let orders = diff_by_key(
            &a.orders,
            &b.orders,
            |o| o.order_id.clone(),
            |x, y| {
                (x.filled_qty - y.filled_qty).abs() > f64::EPSILON || x.status != y.status
            },
        );
        let positions = diff_by_key(
            &a.positions,
            &b.positions,
            |p| format!("{}:{}", p.market_id, p.outcome),
            |x, y| (x.shares - y.shares).abs() > f64::EPSILON,
        );
        SnapshotDiff { orders, positions }
    }

    // -------------------------------------------------------------------------
    // Periodic timer & retention
    // -------------------------------------------------------------------------

    /// Start the periodic FULL snapshot timer. A second call replaces the
    /// previous timer.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.create_snapshot(SnapshotType::Full, None, None);
            }
        });
        if let Some(old) = self.timer.lock().replace(handle) {
            old.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "snapshot timer started");
    }

    /// Stop the timer and take one final FULL snapshot (shutdown path).
    pub fn shutdown(&self) -> Snapshot {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        info!("snapshot service shutting down — taking final FULL snapshot");
        self.create_snapshot(SnapshotType::Full, None, None)
    }

    /// Drop snapshots past retention, then oldest-first down to the cap.
    fn prune(&self, now: DateTime<Utc>) {
        let mut snapshots = self.snapshots.write();
        let cutoff = now - self.retention;

        let before = snapshots.len();
        snapshots.retain(|s| s.metadata.timestamp >= cutoff);

        while snapshots.len() > self.max_in_memory {
            // Stored in insertion order == timestamp order; drop the oldest.
            snapshots.remove(0);
        }

        let dropped = before - snapshots.len();
        if dropped > 0 {
            debug!(dropped, remaining = snapshots.len(), "snapshots pruned");
        }
    }
}

impl std::fmt::Debug for SnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotService")
            .field("stored", &self.snapshots.read().len())
            .field("max_in_memory", &self.max_in_memory)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Diff helper
// ---------------------------------------------------------------------------

fn diff_by_key<T: Clone, K: std::hash::Hash + Eq>(
    a: &[T],
    b: &[T],
    key: impl Fn(&T) -> K,
    changed: impl Fn(&T, &T) -> bool,
) -> EntityDiff<T> {
    let a_map: HashMap<K, &T> = a.iter().map(|x| (key(x), x)).collect();
    let b_map: HashMap<K, &T> = b.iter().map(|x| (key(x), x)).collect();

    let added = b
        .iter()
        .filter(|x| !a_map.contains_key(&key(x)))
        .cloned()
        .collect();
    let removed = a
        .iter()
        .filter(|x| !b_map.contains_key(&key(x)))
        .cloned()
        .collect();
    let changed = a
        .iter()
        .filter_map(|x| {
            b_map
                .get(&key(x))
                .filter(|y| changed(x, y))
                .map(|y| (x.clone(), (*y).clone()))
        })
        .collect();

    EntityDiff {
        added,
        removed,
        changed,
    }
}
