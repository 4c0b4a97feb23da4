// =============================================================================
// Semantic Similarity Service — weighted multi-channel article comparison
// =============================================================================
//
// Feature vector per article: embedding + entity list + topic + keywords.
// Pairwise score is a weighted sum of channels:
//
//   with LLM:     0.25 cosine + 0.30 entity + 0.20 topic + 0.10 keyword + 0.15 llm
//   without LLM:  0.35 cosine + 0.35 entity + 0.20 topic + 0.10 keyword
//
// The result is clipped to [0, 1]. Batched helpers work in windows of 10 to
// bound LLM pressure; embeddings are cached in an LRU keyed by article id.
// =============================================================================

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::llm::{parse_similarity, LlmClient};
use super::model::{EntityType, ExtractedEntity};
use super::vector::{cosine_similarity, EmbeddingProvider};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Comparison features of one article.
#[derive(Debug, Clone)]
pub struct ArticleFeatures {
    pub article_id: String,
    pub embedding: Vec<f32>,
    pub entities: Vec<ExtractedEntity>,
    pub topic: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimilarityMethod {
    Cosine,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SimilarityScore {
    pub score: f64,
    pub method: SimilarityMethod,
}

/// LRU capacity of the embedding cache.
const EMBEDDING_CACHE_CAPACITY: usize = 1_000;
/// Window size for batched similarity work.
const BATCH_WINDOW: usize = 10;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct SemanticSimilarityService {
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
    embedding_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl SemanticSimilarityService {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            embedder,
            llm,
            embedding_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Embeddings
    // -------------------------------------------------------------------------

    /// Embed `text`, serving repeats from the article-id-keyed LRU.
    pub async fn embedding_for(&self, article_id: &str, text: &str) -> anyhow::Result<Vec<f32>> {
        if let Some(hit) = self.embedding_cache.lock().get(article_id).cloned() {
            return Ok(hit);
        }
        let embedding = self.embedder.embed(text).await?;
        self.embedding_cache
            .lock()
            .put(article_id.to_string(), embedding.clone());
        Ok(embedding)
    }

    // -------------------------------------------------------------------------
    // Pairwise scoring
    // -------------------------------------------------------------------------

    /// Full weighted similarity between two articles. `use_llm` additionally
    /// asks the LLM for a judgment when the endpoint is available; an LLM
    /// failure silently degrades to the cosine-method weighting.
    pub async fn calculate(
        &self,
        a: &ArticleFeatures,
        b: &ArticleFeatures,
        use_llm: bool,
    ) -> SimilarityScore {
        let cos = (cosine_similarity(&a.embedding, &b.embedding) + 1.0) / 2.0;
        let entity = entity_similarity(&a.entities, &b.entities);
        let topic = token_jaccard(&a.topic, &b.topic);
        let keyword = keyword_jaccard(&a.keywords, &b.keywords);

        let llm_score = if use_llm && self.llm.is_available() {
            self.llm_similarity(a, b).await
        } else {
            None
        };

        let (score, method) = match llm_score {
            Some(llm) => (
                0.25 * cos + 0.30 * entity + 0.20 * topic + 0.10 * keyword + 0.15 * llm,
                SimilarityMethod::Hybrid,
            ),
            None => (
                0.35 * cos + 0.35 * entity + 0.20 * topic + 0.10 * keyword,
                SimilarityMethod::Cosine,
            ),
        };

        SimilarityScore {
            score: score.clamp(0.0, 1.0),
            method,
        }
    }

    /// Score `target` against every candidate, in windows of 10.
    pub async fn batch_calculate(
        &self,
        target: &ArticleFeatures,
        candidates: &[ArticleFeatures],
        use_llm: bool,
    ) -> Vec<SimilarityScore> {
        let mut scores = Vec::with_capacity(candidates.len());
        for window in candidates.chunks(BATCH_WINDOW) {
            for candidate in window {
                scores.push(self.calculate(target, candidate, use_llm).await);
            }
        }
        scores
    }

    /// Top-k candidates above `threshold`, best first.
    pub async fn find_most_similar(
        &self,
        target: &ArticleFeatures,
        candidates: &[ArticleFeatures],
        top_k: usize,
        threshold: f64,
        use_llm: bool,
    ) -> Vec<(usize, SimilarityScore)> {
        let scores = self.batch_calculate(target, candidates, use_llm).await;
        let mut ranked: Vec<(usize, SimilarityScore)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, s)| s.score >= threshold)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(top_k);
        debug!(
            target = %target.article_id,
            candidates = candidates.len(),
            kept = ranked.len(),
            "similarity ranking complete"
        );
        ranked
    }

    async fn llm_similarity(&self, a: &ArticleFeatures, b: &ArticleFeatures) -> Option<f64> {
        let prompt = format!(
            "Rate the semantic similarity of these two news topics from 0.0 to 1.0. \
             Respond with JSON {{\"similarity\": <number>}}.\n\
             A: {}\nB: {}",
            a.topic, b.topic
        );
        match self.llm.complete_json("similarity", &prompt).await {
            Ok(value) => parse_similarity(&value),
            Err(e) => {
                warn!(error = %e, "llm similarity failed — falling back to cosine weighting");
                None
            }
        }
    }
}

impl std::fmt::Debug for SemanticSimilarityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticSimilarityService")
            .field("cached_embeddings", &self.embedding_cache.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Channel implementations
// ---------------------------------------------------------------------------

/// Per-type weight of an entity match.
fn entity_weight(entity_type: EntityType) -> f64 {
    match entity_type {
        EntityType::Token => 1.0,
        EntityType::Organization | EntityType::GovernmentBody => 0.9,
        EntityType::Protocol => 0.8,
        EntityType::Person | EntityType::Event => 0.7,
        EntityType::Country => 0.6,
        EntityType::Location => 0.5,
        EntityType::Amount => 0.3,
        EntityType::Date => 0.2,
    }
}

/// Type-weighted entity overlap. For each entity in `a`, a match in `b` (by
/// normalized name, or case-insensitive display name) contributes
/// weight * min(confidence); the sum is normalized by the total weight of `a`
/// and damped by the size imbalance between the two sets.
pub fn entity_similarity(a: &[ExtractedEntity], b: &[ExtractedEntity]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut matched = 0.0;
    let mut total_weight = 0.0;
    for ea in a {
        let weight = entity_weight(ea.entity_type);
        total_weight += weight;
        let hit = b.iter().find(|eb| {
            eb.normalized == ea.normalized || eb.name.eq_ignore_ascii_case(&ea.name)
        });
        if let Some(eb) = hit {
            matched += weight * ea.confidence.min(eb.confidence);
        }
    }

    if total_weight == 0.0 {
        return 0.0;
    }

    let size_factor = 0.7
        + 0.3 * (a.len().min(b.len()) as f64 / a.len().max(b.len()) as f64);
    ((matched / total_weight) * size_factor).clamp(0.0, 1.0)
}

/// Jaccard over lowercased whitespace tokens.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let set_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    jaccard(&set_a, &set_b)
}

/// Jaccard over lowercased keyword sets.
pub fn keyword_jaccard(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<String> = a.iter().map(|k| k.to_lowercase()).collect();
    let set_b: HashSet<String> = b.iter().map(|k| k.to_lowercase()).collect();
    jaccard(&set_a, &set_b)
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::llm::DisabledLlmClient;
    use crate::news::model::EntitySource;
    use crate::news::vector::HashingEmbedder;

    fn entity(name: &str, entity_type: EntityType, confidence: f64) -> ExtractedEntity {
        ExtractedEntity {
            name: name.into(),
            normalized: name.to_lowercase(),
            entity_type,
            confidence,
            source: EntitySource::Regex,
        }
    }

    fn features(id: &str, topic: &str, keywords: &[&str], embedding: Vec<f32>) -> ArticleFeatures {
        ArticleFeatures {
            article_id: id.into(),
            embedding,
            entities: vec![],
            topic: topic.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn entity_similarity_identical_sets() {
        let a = vec![
            entity("Bitcoin", EntityType::Token, 0.9),
            entity("SEC", EntityType::GovernmentBody, 0.8),
        ];
        // Full overlap, equal sizes: matched/total = min-conf weighted ratio,
        // size factor 1.0.
        let score = entity_similarity(&a, &a);
        // (1.0*0.9 + 0.9*0.8) / (1.0 + 0.9) = 1.62/1.9
        assert!((score - 1.62 / 1.9).abs() < 1e-9);
    }

    #[test]
    fn entity_similarity_size_imbalance_dampens() {
        let a = vec![entity("Bitcoin", EntityType::Token, 1.0)];
        let mut b = a.clone();
        b.push(entity("SEC", EntityType::GovernmentBody, 0.8));
        b.push(entity("ECB", EntityType::GovernmentBody, 0.8));
        b.push(entity("Coinbase", EntityType::Organization, 0.8));

        // Full match on A's side, but sizes 1 vs 4: factor = 0.7 + 0.3*0.25.
        let score = entity_similarity(&a, &b);
        assert!((score - 0.775).abs() < 1e-9);
    }

    #[test]
    fn entity_similarity_empty_is_zero() {
        assert_eq!(entity_similarity(&[], &[entity("X", EntityType::Token, 1.0)]), 0.0);
    }

    #[test]
    fn jaccard_channels() {
        assert!((token_jaccard("fed raises rates", "fed hikes rates") - 0.5).abs() < 1e-9);
        assert_eq!(token_jaccard("alpha beta", "gamma delta"), 0.0);
        assert!(
            (keyword_jaccard(
                &["fed".into(), "rates".into()],
                &["FED".into(), "rates".into()]
            ) - 1.0)
                .abs()
                < 1e-9
        );
    }

    #[tokio::test]
    async fn cosine_method_weighting_without_llm() {
        let service = SemanticSimilarityService::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(DisabledLlmClient),
        );
        // Identical features: cosine=1 -> mapped 1.0, topic=1, keyword=1,
        // entity=0 (empty sets). Score = 0.35 + 0 + 0.20 + 0.10 = 0.65.
        let a = features("a", "fed raises rates", &["fed", "rates"], vec![1.0, 0.0]);
        let b = features("b", "fed raises rates", &["fed", "rates"], vec![1.0, 0.0]);

        let result = service.calculate(&a, &b, true).await;
        assert_eq!(result.method, SimilarityMethod::Cosine);
        assert!((result.score - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn find_most_similar_ranks_and_thresholds() {
        let service = SemanticSimilarityService::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(DisabledLlmClient),
        );
        let target = features("t", "fed raises interest rates", &["fed", "rates"], vec![1.0, 0.0]);
        let close = features("c1", "fed raises interest rates", &["fed", "rates"], vec![1.0, 0.0]);
        let far = features("c2", "dolphin migration season", &["ocean"], vec![0.0, 1.0]);

        let ranked = service
            .find_most_similar(&target, &[far.clone(), close.clone()], 5, 0.5, false)
            .await;
        assert_eq!(ranked.len(), 1);
        // Index refers to the candidates slice.
        assert_eq!(ranked[0].0, 1);
    }

    #[tokio::test]
    async fn embedding_cache_hits_by_article_id() {
        let service = SemanticSimilarityService::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(DisabledLlmClient),
        );
        let first = service.embedding_for("a-1", "fed raises rates").await.unwrap();
        // Different text, same id: cache wins, embedding unchanged.
        let second = service.embedding_for("a-1", "completely different").await.unwrap();
        assert_eq!(first, second);
    }
}
