// =============================================================================
// Prediction Venue — market data and order flow, paper or live
// =============================================================================
//
// SECURITY: the CLOB secret is never logged or serialized. Signed requests
// carry the API key as a header and an HMAC-SHA256 signature of the payload.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::resilience::http::{CallClass, ResilientHttpClient};

use super::model::{OrderState, PredictionMarket};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Venue acknowledgment of an order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueAck {
    pub venue_order_id: String,
}

/// One venue-side position, as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    /// Market id on binary venues.
    pub symbol: String,
    pub shares: f64,
    pub average_price: f64,
}

#[async_trait]
pub trait PredictionVenue: Send + Sync {
    fn name(&self) -> &str;

    /// Open markets, most liquid first.
    async fn fetch_markets(&self, limit: usize) -> anyhow::Result<Vec<PredictionMarket>>;

    /// Last (yes, no) prices for one market.
    async fn fetch_prices(&self, market_id: &str) -> anyhow::Result<(f64, f64)>;

    /// Submit an order; returns the venue's order id.
    async fn submit_order(&self, order: &OrderState, price: f64) -> anyhow::Result<VenueAck>;

    /// Positions as the venue sees them (reconciliation input).
    async fn fetch_positions(&self) -> anyhow::Result<Vec<VenuePosition>>;
}

// ---------------------------------------------------------------------------
// Paper venue
// ---------------------------------------------------------------------------

/// Offline venue with scripted markets and deterministic acknowledgments.
/// Orders are acked immediately; positions mirror what tests configure.
pub struct PaperVenue {
    markets: RwLock<Vec<PredictionMarket>>,
    positions: RwLock<Vec<VenuePosition>>,
    submissions: RwLock<Vec<OrderState>>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(Vec::new()),
            positions: RwLock::new(Vec::new()),
            submissions: RwLock::new(Vec::new()),
        }
    }

    pub fn set_markets(&self, markets: Vec<PredictionMarket>) {
        *self.markets.write() = markets;
    }

    pub fn set_positions(&self, positions: Vec<VenuePosition>) {
        *self.positions.write() = positions;
    }

    pub fn submissions(&self) -> Vec<OrderState> {
        self.submissions.read().clone()
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PredictionVenue for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_markets(&self, limit: usize) -> anyhow::Result<Vec<PredictionMarket>> {
        let mut markets = self.markets.read().clone();
        markets.sort_by(|a, b| b.volume.partial_cmp(&a.volume).unwrap_or(std::cmp::Ordering::Equal));
        markets.truncate(limit);
        Ok(markets)
    }

    async fn fetch_prices(&self, market_id: &str) -> anyhow::Result<(f64, f64)> {
        self.markets
            .read()
            .iter()
            .find(|m| m.market_id == market_id)
            .map(|m| (m.last_yes_price, m.last_no_price))
            .ok_or_else(|| anyhow::anyhow!("unknown market {market_id}"))
    }

    async fn submit_order(&self, order: &OrderState, _price: f64) -> anyhow::Result<VenueAck> {
        self.submissions.write().push(order.clone());
        Ok(VenueAck {
            venue_order_id: format!("paper-{}", order.client_order_id),
        })
    }

    async fn fetch_positions(&self) -> anyhow::Result<Vec<VenuePosition>> {
        Ok(self.positions.read().clone())
    }
}

// ---------------------------------------------------------------------------
// Live HTTP venue
// ---------------------------------------------------------------------------

/// Live venue over the resilient HTTP client. `api_base` serves market data
/// (info bucket); `clob_base` takes signed order flow (exchange bucket).
pub struct HttpPredictionVenue {
    http: Arc<ResilientHttpClient>,
    api_base: String,
    clob_base: String,
    api_key: String,
    secret: String,
}

impl HttpPredictionVenue {
    pub fn new(
        http: Arc<ResilientHttpClient>,
        api_base: impl Into<String>,
        clob_base: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            clob_base: clob_base.into(),
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Parse one market object leniently; `None` when no id is present.
    fn parse_market(value: &serde_json::Value) -> Option<PredictionMarket> {
        let market_id = value
            .get("market_id")
            .or_else(|| value.get("id"))
            .or_else(|| value.get("conditionId"))
            .and_then(|v| v.as_str())?
            .to_string();

        let title = value
            .get("title")
            .or_else(|| value.get("question"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let outcomes = value
            .get("outcomes")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|o| o.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_else(|| vec!["YES".to_string(), "NO".to_string()]);

        let num = |keys: &[&str]| -> f64 {
            keys.iter()
                .find_map(|k| {
                    let v = value.get(*k)?;
                    v.as_f64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
                .unwrap_or(0.0)
        };

        let last_yes = num(&["last_yes_price", "yesPrice", "lastTradePrice"]).clamp(0.0, 1.0);

        let open_until = value
            .get("open_until")
            .or_else(|| value.get("endDate"))
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        Some(PredictionMarket {
            market_id,
            title,
            outcomes,
            last_yes_price: last_yes,
            last_no_price: {
                let no = num(&["last_no_price", "noPrice"]);
                if no > 0.0 { no.clamp(0.0, 1.0) } else { (1.0 - last_yes).clamp(0.0, 1.0) }
            },
            volume: num(&["volume", "volume24hr"]),
            open_until,
        })
    }
}

#[async_trait]
impl PredictionVenue for HttpPredictionVenue {
    fn name(&self) -> &str {
        "polymarket"
    }

    #[instrument(skip(self), name = "venue::fetch_markets")]
    async fn fetch_markets(&self, limit: usize) -> anyhow::Result<Vec<PredictionMarket>> {
        let url = format!("{}/markets?active=true&limit={limit}", self.api_base);
        let body = self
            .http
            .request_json(CallClass::Info, "venue-info", 1, self.http.inner().get(&url))
            .await?;

        let items = body
            .get("markets")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| body.as_array().cloned())
            .unwrap_or_default();

        let markets: Vec<PredictionMarket> =
            items.iter().filter_map(Self::parse_market).collect();
        debug!(count = markets.len(), "markets fetched");
        Ok(markets)
    }

    #[instrument(skip(self), name = "venue::fetch_prices")]
    async fn fetch_prices(&self, market_id: &str) -> anyhow::Result<(f64, f64)> {
        let url = format!("{}/prices?market={market_id}", self.api_base);
        let body = self
            .http
            .request_json(CallClass::Info, "venue-info", 1, self.http.inner().get(&url))
            .await?;

        let yes = body
            .get("yes")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("price response missing 'yes'"))?;
        let no = body.get("no").and_then(|v| v.as_f64()).unwrap_or(1.0 - yes);
        Ok((yes.clamp(0.0, 1.0), no.clamp(0.0, 1.0)))
    }

    #[instrument(skip(self, order, price), name = "venue::submit_order")]
    async fn submit_order(&self, order: &OrderState, price: f64) -> anyhow::Result<VenueAck> {
        let timestamp = Utc::now().timestamp_millis();
        let payload = serde_json::json!({
            "market": order.market_id,
            "side": order.side.to_string(),
            "size": order.order_qty,
            "price": price,
            "client_order_id": order.client_order_id,
            "timestamp": timestamp,
        });
        let signature = self.sign(&payload.to_string());

        let builder = self
            .http
            .inner()
            .post(format!("{}/order", self.clob_base))
            .header("X-API-KEY", &self.api_key)
            .header("X-SIGNATURE", signature)
            .header("X-TIMESTAMP", timestamp.to_string())
            .json(&payload);

        let body = self
            .http
            .request_json(CallClass::Exchange, "venue-exchange", 1, builder)
            .await?;

        let venue_order_id = body
            .get("order_id")
            .or_else(|| body.get("orderId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("order response missing id: {body}"))?
            .to_string();

        debug!(market_id = %order.market_id, venue_order_id = %venue_order_id, "order submitted");
        Ok(VenueAck { venue_order_id })
    }

    #[instrument(skip(self), name = "venue::fetch_positions")]
    async fn fetch_positions(&self) -> anyhow::Result<Vec<VenuePosition>> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(&format!("positions{timestamp}"));
        let builder = self
            .http
            .inner()
            .get(format!("{}/positions", self.clob_base))
            .header("X-API-KEY", &self.api_key)
            .header("X-SIGNATURE", signature)
            .header("X-TIMESTAMP", timestamp.to_string());

        let body = self
            .http
            .request_json(CallClass::Info, "venue-exchange", 1, builder)
            .await?;

        let items = body
            .get("positions")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| body.as_array().cloned())
            .unwrap_or_default();

        let positions = items
            .iter()
            .filter_map(|p| {
                Some(VenuePosition {
                    symbol: p.get("market").or_else(|| p.get("symbol"))?.as_str()?.to_string(),
                    shares: p.get("shares").or_else(|| p.get("size"))?.as_f64()?,
                    average_price: p
                        .get("average_price")
                        .or_else(|| p.get("avgPrice"))
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0),
                })
            })
            .collect::<Vec<_>>();

        if positions.len() != items.len() {
            warn!(
                parsed = positions.len(),
                raw = items.len(),
                "some venue positions failed to parse"
            );
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for HttpPredictionVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPredictionVenue")
            .field("api_base", &self.api_base)
            .field("clob_base", &self.clob_base)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::model::{OrderSide, OrderStatus};
    use serde_json::json;

    fn market(id: &str, yes: f64, volume: f64) -> PredictionMarket {
        PredictionMarket {
            market_id: id.into(),
            title: format!("Market {id}"),
            outcomes: vec!["YES".into(), "NO".into()],
            last_yes_price: yes,
            last_no_price: 1.0 - yes,
            volume,
            open_until: None,
        }
    }

    #[tokio::test]
    async fn paper_venue_ranks_markets_by_volume() {
        let venue = PaperVenue::new();
        venue.set_markets(vec![
            market("m-1", 0.4, 100.0),
            market("m-2", 0.6, 900.0),
            market("m-3", 0.5, 500.0),
        ]);
        let markets = venue.fetch_markets(2).await.unwrap();
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].market_id, "m-2");
    }

    #[tokio::test]
    async fn paper_venue_acks_orders() {
        let venue = PaperVenue::new();
        let order = OrderState {
            order_id: "o-1".into(),
            client_order_id: "c-1".into(),
            venue_order_id: None,
            market_id: "m-1".into(),
            side: OrderSide::Buy,
            order_qty: 10.0,
            filled_qty: 0.0,
            avg_px: 0.0,
            status: OrderStatus::Pending,
            timestamp: Utc::now().to_rfc3339(),
        };
        let ack = venue.submit_order(&order, 0.5).await.unwrap();
        assert_eq!(ack.venue_order_id, "paper-c-1");
        assert_eq!(venue.submissions().len(), 1);
    }

    #[test]
    fn lenient_market_parsing() {
        let value = json!({
            "conditionId": "m-9",
            "question": "Will it happen?",
            "lastTradePrice": "0.62",
            "volume24hr": 12345.0,
            "unknown_field": { "nested": true },
        });
        let market = HttpPredictionVenue::parse_market(&value).unwrap();
        assert_eq!(market.market_id, "m-9");
        assert!((market.last_yes_price - 0.62).abs() < 1e-9);
        // NO price derived from YES when absent.
        assert!((market.last_no_price - 0.38).abs() < 1e-9);
        assert_eq!(market.outcomes, vec!["YES", "NO"]);
    }

    #[test]
    fn market_without_id_is_dropped() {
        assert!(HttpPredictionVenue::parse_market(&json!({ "question": "?" })).is_none());
    }
}
