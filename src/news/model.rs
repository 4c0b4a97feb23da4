// =============================================================================
// News data model — articles, entities, labels, clusters, heat
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Article
// ---------------------------------------------------------------------------

/// One ingested article. Articles are append-only; `id` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub snippet: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub language: String,
    /// Ordered; the first entry is the primary category.
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Article {
    pub fn primary_category(&self) -> &str {
        self.categories.first().map(String::as_str).unwrap_or("GENERAL")
    }
}

/// Lowercased, punctuation-stripped, whitespace-normalized form of a title.
/// Stable for byte-identical titles modulo punctuation and case; used for
/// O(1) duplicate detection.
pub fn title_fingerprint(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Closed set of recognized entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Country,
    Token,
    Protocol,
    GovernmentBody,
    Event,
    Amount,
    Date,
}

/// Where an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitySource {
    Regex,
    Llm,
    Hybrid,
}

/// One extracted named entity. Within one extraction, (entity_type,
/// normalized) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    /// Lowercased, trimmed form used as the dedup key.
    pub normalized: String,
    pub entity_type: EntityType,
    /// In [0, 1].
    pub confidence: f64,
    pub source: EntitySource,
}

// ---------------------------------------------------------------------------
// AI label
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// LLM-produced label for one article. `topic` must pass quality validation
/// or the article is dropped from clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiLabel {
    pub topic: String,
    /// Slug of `topic`, max 180 chars; the primary cluster lookup key.
    pub topic_key: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sub_event_type: Option<String>,
    pub trend_direction: TrendDirection,
    pub urgency: Urgency,
}

/// Generic phrases that disqualify a topic outright.
const GENERIC_TOPIC_PHRASES: &[&str] = &[
    "market update",
    "daily roundup",
    "news roundup",
    "top stories",
    "breaking news",
    "latest news",
    "what you need to know",
    "weekly recap",
];

/// Topic quality validation: at least 5 chars, at least 3 words, at least one
/// proper-noun-like token, and no known generic phrase.
pub fn validate_topic(topic: &str) -> Result<(), String> {
    let trimmed = topic.trim();
    if trimmed.len() < 5 {
        return Err(format!("topic too short: '{trimmed}'"));
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.len() < 3 {
        return Err(format!("topic has fewer than 3 words: '{trimmed}'"));
    }
    let has_proper = words.iter().any(|w| {
        w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) && w.len() > 1
    });
    if !has_proper {
        return Err(format!("topic has no proper-noun-like token: '{trimmed}'"));
    }
    let lower = trimmed.to_lowercase();
    if let Some(phrase) = GENERIC_TOPIC_PHRASES.iter().find(|p| lower.contains(*p)) {
        return Err(format!("topic contains generic phrase '{phrase}'"));
    }
    Ok(())
}

/// Maximum topic-key length.
const TOPIC_KEY_MAX_LEN: usize = 180;

/// Deterministic slug of a topic: lowercase, non-alphanumerics collapsed to
/// single underscores, truncated to 180 chars.
pub fn topic_key(topic: &str) -> String {
    let mut key = String::with_capacity(topic.len());
    let mut last_was_sep = true;
    for c in topic.to_lowercase().chars() {
        if c.is_alphanumeric() {
            key.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            key.push('_');
            last_was_sep = true;
        }
    }
    while key.ends_with('_') {
        key.pop();
    }
    key.truncate(TOPIC_KEY_MAX_LEN);
    key
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// One evolving story. `topic_key` is unique per category; `article_count >=
/// unique_title_count >= 1`; `updated_at >= first_seen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCluster {
    pub id: String,
    pub topic: String,
    pub topic_key: String,
    #[serde(default)]
    pub summary: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub heat_score: f64,
    pub article_count: u32,
    pub unique_title_count: u32,
    pub trend_direction: TrendDirection,
    pub urgency: Urgency,
    #[serde(default)]
    pub sub_event_type: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link row between a cluster and one of its articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterArticleLink {
    pub cluster_id: String,
    pub article_id: String,
    pub title_fingerprint: String,
    pub heat_contribution: f64,
}

/// Append-only heat time-series sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatSample {
    pub cluster_id: String,
    pub timestamp: DateTime<Utc>,
    pub heat_score: f64,
    pub article_count: u32,
    pub unique_title_count: u32,
    #[serde(default)]
    pub velocity: Option<f64>,
}

/// Cluster-to-cluster relation. RELATED is undirected; the others directed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrossRefRelation {
    Related,
    MergedInto,
    ParentOf,
}

/// One cross-reference edge, unique on (a, b, relation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossRef {
    pub cluster_a: String,
    pub cluster_b: String,
    pub relation: CrossRefRelation,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Heat scoring
// ---------------------------------------------------------------------------

/// Half-life of a heat contribution, in hours.
const HEAT_HALF_LIFE_HOURS: f64 = 24.0;

/// Base heat of one fresh article before multipliers.
const HEAT_BASE: f64 = 10.0;

/// Heat contributed by an article given its label: base, scaled by urgency
/// and trend, decayed by the article's age.
pub fn enhanced_heat(article: &Article, label: &AiLabel, now: DateTime<Utc>) -> f64 {
    let urgency_factor = match label.urgency {
        Urgency::Low => 0.8,
        Urgency::Medium => 1.0,
        Urgency::High => 1.3,
        Urgency::Critical => 1.6,
    };
    let trend_factor = match label.trend_direction {
        TrendDirection::Up => 1.1,
        TrendDirection::Down => 1.05,
        TrendDirection::Neutral => 1.0,
    };
    let age_hours = (now - article.published_at).num_minutes().max(0) as f64 / 60.0;
    HEAT_BASE * urgency_factor * trend_factor * decay_factor(age_hours)
}

/// Exponential decay by age: halves every [`HEAT_HALF_LIFE_HOURS`].
pub fn decay_factor(age_hours: f64) -> f64 {
    0.5_f64.powf(age_hours.max(0.0) / HEAT_HALF_LIFE_HOURS)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalizes_case_punct_whitespace() {
        assert_eq!(
            title_fingerprint("Fed  Raises   Rates!"),
            "fed raises rates"
        );
        assert_eq!(
            title_fingerprint("FED raises rates"),
            title_fingerprint("fed, raises; rates...")
        );
    }

    #[test]
    fn topic_validation_rules() {
        assert!(validate_topic("Fed Raises Interest Rates").is_ok());
        // Too short.
        assert!(validate_topic("Fed").is_err());
        // Fewer than 3 words.
        assert!(validate_topic("Fed Rates").is_err());
        // No proper-noun-like token.
        assert!(validate_topic("the rates went up").is_err());
        // Generic phrase.
        assert!(validate_topic("Crypto Market Update Today").is_err());
    }

    #[test]
    fn topic_key_slugging() {
        assert_eq!(topic_key("Fed Raises Rates"), "fed_raises_rates");
        assert_eq!(topic_key("  SEC v. Ripple: Ruling!  "), "sec_v_ripple_ruling");

        let long = "word ".repeat(100);
        assert!(topic_key(&long).len() <= 180);
    }

    #[test]
    fn heat_decays_with_age() {
        assert!((decay_factor(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((decay_factor(24.0) - 0.5).abs() < 1e-12);
        assert!(decay_factor(48.0) < decay_factor(24.0));
    }

    #[test]
    fn enhanced_heat_scales_with_urgency() {
        let now = Utc::now();
        let article = Article {
            id: "a-1".into(),
            url: "https://example.com/1".into(),
            title: "Fed Raises Rates".into(),
            content: String::new(),
            snippet: String::new(),
            source: "wire".into(),
            published_at: now,
            language: "en".into(),
            categories: vec!["MACRO".into()],
            tags: vec![],
        };
        let mut label = AiLabel {
            topic: "Fed Raises Interest Rates".into(),
            topic_key: topic_key("Fed Raises Interest Rates"),
            keywords: vec!["fed".into(), "rates".into()],
            sub_event_type: None,
            trend_direction: TrendDirection::Neutral,
            urgency: Urgency::Low,
        };
        let low = enhanced_heat(&article, &label, now);
        label.urgency = Urgency::Critical;
        let critical = enhanced_heat(&article, &label, now);
        assert!(critical > low);
    }
}
