// =============================================================================
// LLM Collaborator Seam — black-box JSON callables with lenient parsing
// =============================================================================
//
// The LLM is an unreliable oracle: every call may fail, time out, or return
// malformed JSON. Callers must always have a non-LLM path. Parsing here is
// permissive: unknown fields are dropped, missing fields produce typed
// fallbacks, and enum-like strings are normalized through an alias table.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::resilience::http::{CallClass, ResilientHttpClient};

use super::model::{AiLabel, EntityType, TrendDirection, Urgency};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A JSON-in / JSON-out LLM endpoint. `task` names the operation for logging
/// and breaker scoping ("categorize", "label", "entities", "similarity").
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_json(&self, task: &str, prompt: &str) -> anyhow::Result<Value>;

    /// Whether the endpoint is configured at all. When false, callers skip
    /// the LLM stage without logging errors.
    fn is_available(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// LLM endpoint reached over the resilient HTTP client. The wire contract is
/// a POST of `{ "task": ..., "prompt": ... }` returning arbitrary JSON.
pub struct HttpLlmClient {
    http: Arc<ResilientHttpClient>,
    endpoint: String,
}

impl HttpLlmClient {
    pub fn new(http: Arc<ResilientHttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete_json(&self, task: &str, prompt: &str) -> anyhow::Result<Value> {
        let builder = self.http.inner().post(&self.endpoint).json(&serde_json::json!({
            "task": task,
            "prompt": prompt,
        }));
        let breaker = format!("llm-{task}");
        let value = self
            .http
            .request_json(CallClass::Info, &breaker, 1, builder)
            .await?;
        debug!(task, "llm response received");
        Ok(value)
    }

    fn is_available(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Primary endpoint with a secondary fallback: the fallback is asked only
/// when the primary call fails, keeping labeling alive through primary
/// outages.
pub struct FallbackLlmClient {
    primary: Arc<dyn LlmClient>,
    secondary: Arc<dyn LlmClient>,
}

impl FallbackLlmClient {
    pub fn new(primary: Arc<dyn LlmClient>, secondary: Arc<dyn LlmClient>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl LlmClient for FallbackLlmClient {
    async fn complete_json(&self, task: &str, prompt: &str) -> anyhow::Result<Value> {
        match self.primary.complete_json(task, prompt).await {
            Ok(value) => Ok(value),
            Err(primary_err) if self.secondary.is_available() => {
                debug!(task, error = %primary_err, "primary llm failed — trying secondary");
                self.secondary.complete_json(task, prompt).await
            }
            Err(e) => Err(e),
        }
    }

    fn is_available(&self) -> bool {
        self.primary.is_available() || self.secondary.is_available()
    }
}

/// Stand-in when no endpoint is configured; every call errors and
/// `is_available` is false so callers skip the stage silently.
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete_json(&self, task: &str, _prompt: &str) -> anyhow::Result<Value> {
        anyhow::bail!("llm endpoint not configured (task {task})")
    }

    fn is_available(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Lenient field access
// ---------------------------------------------------------------------------

/// Fetch the first present string field among `keys` (LLMs alternate between
/// snake_case and camelCase).
pub fn get_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

pub fn get_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        let v = value.get(*k)?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

pub fn get_array<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_array))
}

// ---------------------------------------------------------------------------
// Enum normalization
// ---------------------------------------------------------------------------

/// Alias table from LLM vocabulary to the closed entity-type set.
pub fn normalize_entity_type(raw: &str) -> Option<EntityType> {
    let key = raw.trim().to_uppercase().replace([' ', '-'], "_");
    let t = match key.as_str() {
        "PERSON" | "PEOPLE" | "INDIVIDUAL" => EntityType::Person,
        "ORGANIZATION" | "ORGANISATION" | "COMPANY" | "CORPORATION" | "FIRM" | "EXCHANGE" => {
            EntityType::Organization
        }
        "LOCATION" | "CITY" | "REGION" | "PLACE" => EntityType::Location,
        "COUNTRY" | "NATION" => EntityType::Country,
        "TOKEN" | "CRYPTOCURRENCY" | "CRYPTO" | "COIN" | "ASSET" => EntityType::Token,
        "PROTOCOL" | "BLOCKCHAIN" | "NETWORK" | "DEFI_PROTOCOL" => EntityType::Protocol,
        "GOVERNMENT_BODY" | "GOVERNMENT" | "AGENCY" | "REGULATOR" | "CENTRAL_BANK" => {
            EntityType::GovernmentBody
        }
        "EVENT" | "CONFERENCE" => EntityType::Event,
        "AMOUNT" | "MONEY" | "VALUE" | "PRICE" => EntityType::Amount,
        "DATE" | "TIME" | "DEADLINE" => EntityType::Date,
        _ => return None,
    };
    Some(t)
}

pub fn parse_trend(raw: Option<&str>) -> TrendDirection {
    match raw.map(|s| s.trim().to_uppercase()).as_deref() {
        Some("UP") | Some("BULLISH") | Some("POSITIVE") | Some("RISING") => TrendDirection::Up,
        Some("DOWN") | Some("BEARISH") | Some("NEGATIVE") | Some("FALLING") => TrendDirection::Down,
        _ => TrendDirection::Neutral,
    }
}

pub fn parse_urgency(raw: Option<&str>) -> Urgency {
    match raw.map(|s| s.trim().to_uppercase()).as_deref() {
        Some("CRITICAL") | Some("URGENT") => Urgency::Critical,
        Some("HIGH") => Urgency::High,
        Some("LOW") => Urgency::Low,
        _ => Urgency::Medium,
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// One entity as reported by the LLM, pre-normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f64,
}

/// Parsed LLM entity-extraction response.
#[derive(Debug, Clone, Default)]
pub struct LlmEntityExtraction {
    pub entities: Vec<LlmEntity>,
    pub event_type: Option<String>,
    pub primary_entity: Option<String>,
}

/// Parse an entity-extraction response. Entries without a recognizable name
/// or type are dropped; confidence defaults to 0.6 and is clamped to [0, 1].
pub fn parse_entity_extraction(value: &Value) -> LlmEntityExtraction {
    let mut out = LlmEntityExtraction {
        event_type: get_str(value, &["eventType", "event_type"]).map(str::to_string),
        primary_entity: get_str(value, &["primaryEntity", "primary_entity"]).map(str::to_string),
        ..Default::default()
    };

    if let Some(items) = get_array(value, &["entities"]) {
        for item in items {
            let name = match get_str(item, &["name", "entity", "text"]) {
                Some(n) if !n.trim().is_empty() => n.trim().to_string(),
                _ => continue,
            };
            let entity_type = match get_str(item, &["type", "entityType", "entity_type"])
                .and_then(normalize_entity_type)
            {
                Some(t) => t,
                None => continue,
            };
            let confidence = get_f64(item, &["confidence", "score"])
                .unwrap_or(0.6)
                .clamp(0.0, 1.0);
            out.entities.push(LlmEntity {
                name,
                entity_type,
                confidence,
            });
        }
    }

    out
}

/// Parse a labeling response into an [`AiLabel`]. Returns `None` only when no
/// topic at all can be recovered; everything else gets a typed fallback.
pub fn parse_label(value: &Value) -> Option<AiLabel> {
    let topic = get_str(value, &["topic", "title", "headline"])?.trim().to_string();
    if topic.is_empty() {
        return None;
    }

    let keywords = get_array(value, &["keywords", "tags"])
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(AiLabel {
        topic_key: super::model::topic_key(&topic),
        topic,
        keywords,
        sub_event_type: get_str(value, &["subEventType", "sub_event_type"]).map(str::to_string),
        trend_direction: parse_trend(get_str(value, &["trendDirection", "trend_direction", "trend"])),
        urgency: parse_urgency(get_str(value, &["urgency"])),
    })
}

/// Parse a pairwise-similarity response into a clamped score.
pub fn parse_similarity(value: &Value) -> Option<f64> {
    get_f64(value, &["similarity", "score"]).map(|s| s.clamp(0.0, 1.0))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn alias_table_normalizes_synonyms() {
        assert_eq!(normalize_entity_type("COMPANY"), Some(EntityType::Organization));
        assert_eq!(normalize_entity_type("city"), Some(EntityType::Location));
        assert_eq!(normalize_entity_type("Cryptocurrency"), Some(EntityType::Token));
        assert_eq!(normalize_entity_type("central bank"), Some(EntityType::GovernmentBody));
        assert_eq!(normalize_entity_type("martian"), None);
    }

    #[test]
    fn entity_extraction_drops_malformed_entries() {
        let value = json!({
            "entities": [
                { "name": "Federal Reserve", "type": "AGENCY", "confidence": 0.9 },
                { "name": "", "type": "PERSON" },
                { "name": "Bitcoin", "type": "something-weird" },
                { "name": "Tether", "type": "COIN", "confidence": 7.5 },
            ],
            "eventType": "rate_decision",
            "primaryEntity": "Federal Reserve",
        });
        let parsed = parse_entity_extraction(&value);
        assert_eq!(parsed.entities.len(), 2);
        assert_eq!(parsed.entities[0].entity_type, EntityType::GovernmentBody);
        // Out-of-range confidence clamped.
        assert!((parsed.entities[1].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(parsed.event_type.as_deref(), Some("rate_decision"));
    }

    #[test]
    fn label_parsing_with_fallbacks() {
        let value = json!({
            "topic": "Fed Raises Interest Rates",
            "keywords": ["fed", "RATES", ""],
            "trend": "bullish",
        });
        let label = parse_label(&value).unwrap();
        assert_eq!(label.topic_key, "fed_raises_interest_rates");
        assert_eq!(label.keywords, vec!["fed", "rates"]);
        assert_eq!(label.trend_direction, TrendDirection::Up);
        assert_eq!(label.urgency, Urgency::Medium);
        assert!(label.sub_event_type.is_none());
    }

    #[test]
    fn label_parsing_requires_topic() {
        assert!(parse_label(&json!({ "keywords": ["x"] })).is_none());
        assert!(parse_label(&json!({ "topic": "   " })).is_none());
    }

    struct FailingLlm;

    #[async_trait::async_trait]
    impl LlmClient for FailingLlm {
        async fn complete_json(&self, _task: &str, _prompt: &str) -> anyhow::Result<Value> {
            anyhow::bail!("primary down")
        }
    }

    struct FixedLlm(Value);

    #[async_trait::async_trait]
    impl LlmClient for FixedLlm {
        async fn complete_json(&self, _task: &str, _prompt: &str) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn fallback_client_uses_secondary_on_primary_failure() {
        let client = FallbackLlmClient::new(
            std::sync::Arc::new(FailingLlm),
            std::sync::Arc::new(FixedLlm(json!({ "topic": "Fed Holds Rates Steady" }))),
        );
        let value = client.complete_json("label", "prompt").await.unwrap();
        assert_eq!(value["topic"], "Fed Holds Rates Steady");
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn fallback_client_propagates_when_secondary_disabled() {
        let client = FallbackLlmClient::new(
            std::sync::Arc::new(FailingLlm),
            std::sync::Arc::new(DisabledLlmClient),
        );
        assert!(client.complete_json("label", "prompt").await.is_err());
    }

    #[test]
    fn similarity_clamped() {
        assert_eq!(parse_similarity(&json!({ "similarity": 1.7 })), Some(1.0));
        assert_eq!(parse_similarity(&json!({ "score": "0.42" })), Some(0.42));
        assert_eq!(parse_similarity(&json!({})), None);
    }
}
