// =============================================================================
// Message Bus — named pub/sub channels over a broadcast fan-out
// =============================================================================
//
// Every pipeline publishes plain JSON records tagged with a channel name.
// Consumers (WebSocket feed, alert sinks, other agents) subscribe to the
// single broadcast stream and filter by channel. Unknown payload fields must
// be treated as forward-compatible by all consumers.
//
// Lagging subscribers lose the oldest messages (broadcast semantics); the bus
// is a notification fabric, not a durable queue.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Closed set of channels carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    NewsClustered,
    NewsAnomaly,
    NewsPrediction,
    NewsHotClusters,
    TradeExecuted,
    StopLossTriggered,
    EmergencyStop,
    DailyPnl,
    Error,
    Info,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NewsClustered => "NEWS_CLUSTERED",
            Self::NewsAnomaly => "NEWS_ANOMALY",
            Self::NewsPrediction => "NEWS_PREDICTION",
            Self::NewsHotClusters => "NEWS_HOT_CLUSTERS",
            Self::TradeExecuted => "TRADE_EXECUTED",
            Self::StopLossTriggered => "STOP_LOSS_TRIGGERED",
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::DailyPnl => "DAILY_PNL",
            Self::Error => "ERROR",
            Self::Info => "INFO",
        };
        write!(f, "{name}")
    }
}

/// One published record: channel tag, free-form payload, publish timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub channel: Channel,
    pub payload: serde_json::Value,
    /// ISO 8601 publish time.
    pub at: String,
}

/// Broadcast-backed message bus shared by every subsystem.
pub struct MessageBus {
    tx: broadcast::Sender<BusEvent>,
}

/// Buffered events per subscriber before the oldest are dropped.
const BUS_CAPACITY: usize = 1024;

impl MessageBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a payload on `channel`. Returns the number of active
    /// subscribers that received the event (zero is not an error — the bus
    /// is fire-and-forget).
    pub fn publish(&self, channel: Channel, payload: serde_json::Value) -> usize {
        let event = BusEvent {
            channel,
            payload,
            at: Utc::now().to_rfc3339(),
        };
        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(channel = %channel, receivers, "bus event published");
        receivers
    }

    /// Subscribe to the full event stream. Filter by [`BusEvent::channel`].
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe();

        bus.publish(
            Channel::TradeExecuted,
            serde_json::json!({ "market_id": "mkt-1", "shares": 25.0 }),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, Channel::TradeExecuted);
        assert_eq!(event.payload["market_id"], "mkt-1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fire_and_forget() {
        let bus = MessageBus::new();
        assert_eq!(bus.publish(Channel::Info, serde_json::json!({})), 0);
    }

    #[test]
    fn channel_names_match_wire_contract() {
        assert_eq!(Channel::NewsClustered.to_string(), "NEWS_CLUSTERED");
        assert_eq!(Channel::StopLossTriggered.to_string(), "STOP_LOSS_TRIGGERED");
        assert_eq!(Channel::DailyPnl.to_string(), "DAILY_PNL");
    }
}
