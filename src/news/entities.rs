// =============================================================================
// Entity Extractor — regex dictionary stage + optional LLM stage
// =============================================================================
//
// Stage 1 matches curated per-type dictionaries (plus amount/date patterns)
// against title + content. Base confidence 0.7, +0.2 for a well-known name,
// +0.05 for multi-word, +0.05 for a TitleCase start, capped at 1.0.
//
// Stage 2 asks the LLM (when available) for entities / eventType /
// primaryEntity, served through an LRU cache keyed by the first 100 title
// chars + first 200 content chars.
//
// Merge key is (type, normalized). When both stages produced a match the
// confidence is boosted by +0.15 (capped) and the source becomes Hybrid.
// =============================================================================

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::llm::{parse_entity_extraction, LlmClient, LlmEntityExtraction};
use super::model::{Article, EntitySource, EntityType, ExtractedEntity};

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

const TOKEN_TERMS: &[&str] = &[
    "bitcoin", "btc", "ethereum", "eth", "solana", "sol", "xrp", "dogecoin",
    "tether", "usdc", "bnb", "cardano", "polkadot", "litecoin",
];

const PROTOCOL_TERMS: &[&str] = &[
    "uniswap", "aave", "chainlink", "lido", "makerdao", "compound", "polygon",
    "arbitrum", "optimism", "base", "curve",
];

const ORGANIZATION_TERMS: &[&str] = &[
    "blackrock", "goldman sachs", "jpmorgan", "coinbase", "binance", "tesla",
    "apple", "microsoft", "nvidia", "openai", "grayscale", "fidelity",
    "morgan stanley", "citadel", "vanguard", "polymarket",
];

const GOVERNMENT_TERMS: &[&str] = &[
    "federal reserve", "fed", "sec", "cftc", "treasury", "ecb", "imf",
    "white house", "congress", "senate", "doj", "fdic", "bank of england",
    "bank of japan",
];

const COUNTRY_TERMS: &[&str] = &[
    "united states", "china", "japan", "germany", "india", "russia", "france",
    "united kingdom", "south korea", "switzerland", "el salvador",
];

const LOCATION_TERMS: &[&str] = &[
    "new york", "london", "hong kong", "singapore", "silicon valley",
    "wall street", "tokyo", "brussels", "davos",
];

const PERSON_TERMS: &[&str] = &[
    "jerome powell", "gary gensler", "elon musk", "donald trump",
    "janet yellen", "christine lagarde", "jamie dimon", "michael saylor",
    "vitalik buterin", "changpeng zhao", "sam altman",
];

const EVENT_TERMS: &[&str] = &[
    "fomc meeting", "halving", "etf approval", "earnings call", "airdrop",
    "mainnet launch", "hard fork", "rate decision",
];

/// Names whose dictionary hits get the +0.2 well-known boost.
const WELL_KNOWN: &[&str] = &[
    "bitcoin", "ethereum", "federal reserve", "sec", "blackrock", "binance",
    "coinbase", "jerome powell", "elon musk", "united states", "china",
];

/// Base confidence of any dictionary hit.
const REGEX_BASE_CONFIDENCE: f64 = 0.7;
/// Threshold an entity must clear to qualify as the primary entity.
const PRIMARY_CONFIDENCE_THRESHOLD: f64 = 0.60;
/// LRU capacity for LLM extraction responses.
const LLM_CACHE_CAPACITY: usize = 500;
/// Prompt body cap sent to the LLM.
const LLM_PROMPT_CONTENT_CHARS: usize = 1_000;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Full output of one extraction pass, sorted by descending confidence.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub event_type: Option<String>,
    pub primary_entity: Option<ExtractedEntity>,
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct EntityExtractor {
    llm: Arc<dyn LlmClient>,
    /// One compiled alternation per entity type.
    matchers: Vec<(EntityType, Regex)>,
    amount_re: Regex,
    date_re: Regex,
    cache: Mutex<LruCache<String, LlmEntityExtraction>>,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        let matchers = vec![
            (EntityType::Token, build_alternation(TOKEN_TERMS)),
            (EntityType::Protocol, build_alternation(PROTOCOL_TERMS)),
            (EntityType::Organization, build_alternation(ORGANIZATION_TERMS)),
            (EntityType::GovernmentBody, build_alternation(GOVERNMENT_TERMS)),
            (EntityType::Country, build_alternation(COUNTRY_TERMS)),
            (EntityType::Location, build_alternation(LOCATION_TERMS)),
            (EntityType::Person, build_alternation(PERSON_TERMS)),
            (EntityType::Event, build_alternation(EVENT_TERMS)),
        ];

        let amount_re = RegexBuilder::new(
            r"\$\s?\d[\d,]*(?:\.\d+)?\s?(?:million|billion|trillion|mn|bn|m|b|k)?",
        )
        .case_insensitive(true)
        .build()
        .expect("amount pattern is valid");

        let date_re = RegexBuilder::new(
            r"\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}(?:,?\s+\d{4})?\b|\b\d{4}-\d{2}-\d{2}\b",
        )
        .case_insensitive(true)
        .build()
        .expect("date pattern is valid");

        Self {
            llm,
            matchers,
            amount_re,
            date_re,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LLM_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Run both stages and merge. LLM failures degrade to regex-only output.
    pub async fn extract(&self, article: &Article) -> ExtractionResult {
        let text = format!("{} {}", article.title, article.content);
        let mut merged: HashMap<(EntityType, String), ExtractedEntity> = self
            .extract_regex(&text)
            .into_iter()
            .map(|e| ((e.entity_type, e.normalized.clone()), e))
            .collect();

        let mut event_type = None;
        if self.llm.is_available() {
            match self.llm_stage(article).await {
                Ok(extraction) => {
                    event_type = extraction.event_type.clone();
                    for llm_entity in extraction.entities {
                        let normalized = llm_entity.name.trim().to_lowercase();
                        let key = (llm_entity.entity_type, normalized.clone());
                        match merged.get_mut(&key) {
                            Some(existing) => {
                                // Both stages agree: boost and mark hybrid.
                                existing.confidence = (existing.confidence + 0.15).min(1.0);
                                existing.source = EntitySource::Hybrid;
                            }
                            None => {
                                merged.insert(
                                    key,
                                    ExtractedEntity {
                                        name: llm_entity.name,
                                        normalized,
                                        entity_type: llm_entity.entity_type,
                                        confidence: llm_entity.confidence.clamp(0.0, 1.0),
                                        source: EntitySource::Llm,
                                    },
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(article_id = %article.id, error = %e, "llm entity stage failed — regex only");
                }
            }
        }

        let mut entities: Vec<ExtractedEntity> = merged.into_values().collect();
        entities.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.normalized.cmp(&b.normalized))
        });

        let primary_entity = entities
            .iter()
            .find(|e| {
                matches!(
                    e.entity_type,
                    EntityType::Token | EntityType::Organization | EntityType::GovernmentBody
                ) && e.confidence > PRIMARY_CONFIDENCE_THRESHOLD
            })
            .cloned();

        debug!(
            article_id = %article.id,
            count = entities.len(),
            primary = primary_entity.as_ref().map(|e| e.normalized.as_str()),
            "entities extracted"
        );

        ExtractionResult {
            entities,
            event_type,
            primary_entity,
        }
    }

    /// Dictionary + pattern stage only (deterministic, synchronous).
    pub fn extract_regex(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut found: HashMap<(EntityType, String), ExtractedEntity> = HashMap::new();

        for (entity_type, re) in &self.matchers {
            for m in re.find_iter(text) {
                let name = m.as_str().to_string();
                let normalized = name.trim().to_lowercase();
                let key = (*entity_type, normalized.clone());
                if found.contains_key(&key) {
                    continue;
                }

                let mut confidence = REGEX_BASE_CONFIDENCE;
                if WELL_KNOWN.contains(&normalized.as_str()) {
                    confidence += 0.2;
                }
                if normalized.contains(' ') {
                    confidence += 0.05;
                }
                if name.chars().next().map(char::is_uppercase).unwrap_or(false) {
                    confidence += 0.05;
                }

                found.insert(
                    key,
                    ExtractedEntity {
                        name,
                        normalized,
                        entity_type: *entity_type,
                        confidence: confidence.min(1.0),
                        source: EntitySource::Regex,
                    },
                );
            }
        }

        for (re, entity_type) in [
            (&self.amount_re, EntityType::Amount),
            (&self.date_re, EntityType::Date),
        ] {
            for m in re.find_iter(text) {
                let name = m.as_str().trim().to_string();
                let normalized = name.to_lowercase();
                found
                    .entry((entity_type, normalized.clone()))
                    .or_insert(ExtractedEntity {
                        name,
                        normalized,
                        entity_type,
                        confidence: REGEX_BASE_CONFIDENCE,
                        source: EntitySource::Regex,
                    });
            }
        }

        found.into_values().collect()
    }

    // -------------------------------------------------------------------------
    // LLM stage
    // -------------------------------------------------------------------------

    async fn llm_stage(&self, article: &Article) -> anyhow::Result<LlmEntityExtraction> {
        let cache_key = format!(
            "{}{}",
            char_prefix(&article.title, 100),
            char_prefix(&article.content, 200)
        );

        if let Some(hit) = self.cache.lock().get(&cache_key).cloned() {
            debug!(article_id = %article.id, "llm entity cache hit");
            return Ok(hit);
        }

        let prompt = format!(
            "Extract named entities from this article. Respond with JSON: \
             {{\"entities\": [{{\"name\", \"type\", \"confidence\"}}], \
             \"eventType\", \"primaryEntity\"}}. \
             Types: PERSON, ORGANIZATION, LOCATION, COUNTRY, TOKEN, PROTOCOL, \
             GOVERNMENT_BODY, EVENT, AMOUNT, DATE.\n\nTitle: {}\n\n{}",
            article.title,
            char_prefix(&article.content, LLM_PROMPT_CONTENT_CHARS),
        );

        let value = self.llm.complete_json("entities", &prompt).await?;
        let extraction = parse_entity_extraction(&value);
        self.cache.lock().put(cache_key, extraction.clone());
        Ok(extraction)
    }
}

impl std::fmt::Debug for EntityExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityExtractor")
            .field("dictionaries", &self.matchers.len())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Case-insensitive word-bounded alternation over `terms`.
fn build_alternation(terms: &[&str]) -> Regex {
    let escaped: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
    RegexBuilder::new(&format!(r"\b(?:{})\b", escaped.join("|")))
        .case_insensitive(true)
        .build()
        .expect("dictionary alternation is valid")
}

/// First `n` chars of `s` (char-boundary safe).
fn char_prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}
