// =============================================================================
// Embeddings & Vector Store — collaborator seams with in-memory fallbacks
// =============================================================================
//
// Real deployments point these traits at an embedding endpoint and a vector
// database. The in-memory implementations keep the engine and its tests
// running offline: a deterministic feature-hash embedder and a brute-force
// cosine store.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

/// Default embedding dimensionality.
pub const EMBEDDING_DIM: usize = 128;

// ---------------------------------------------------------------------------
// Cosine helpers
// ---------------------------------------------------------------------------

/// Cosine similarity in [-1, 1]. Vectors of unequal length are compared as if
/// the shorter were zero-padded.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().max(b.len());
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0.0) as f64;
        let y = b.get(i).copied().unwrap_or(0.0) as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance in [0, 2]: 1 - similarity.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

// ---------------------------------------------------------------------------
// Embedding provider
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Deterministic feature-hash embedder: each lowercased token is hashed into
/// one of `dim` buckets, and the resulting vector is L2-normalized. Not a
/// semantic model, but stable, fast, and good enough to keep vector voting
/// and the tests meaningful without an embedding endpoint.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            // Sign bit from a higher hash bit avoids all-positive vectors.
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// One stored row: an article embedding tagged with its cluster.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub article_id: String,
    pub cluster_id: String,
    pub category: String,
    pub embedding: Vec<f32>,
}

/// One search hit, nearest first.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub article_id: String,
    pub cluster_id: String,
    pub distance: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the row for `record.article_id`.
    async fn upsert(&self, record: VectorRecord) -> anyhow::Result<()>;

    /// Nearest neighbours within `max_distance`, optionally scoped to one
    /// category, nearest first, at most `top_k`.
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        max_distance: f64,
        category: Option<&str>,
    ) -> anyhow::Result<Vec<VectorMatch>>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Brute-force in-memory store keyed by article id.
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Cluster tag of a stored article, if present.
    pub fn cluster_of(&self, article_id: &str) -> Option<String> {
        self.records
            .read()
            .get(article_id)
            .map(|r| r.cluster_id.clone())
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> anyhow::Result<()> {
        debug!(article_id = %record.article_id, cluster_id = %record.cluster_id, "vector upsert");
        self.records
            .write()
            .insert(record.article_id.clone(), record);
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        max_distance: f64,
        category: Option<&str>,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let records = self.records.read();
        let mut matches: Vec<VectorMatch> = records
            .values()
            .filter(|r| category.map(|c| r.category == c).unwrap_or(true))
            .map(|r| VectorMatch {
                article_id: r.article_id.clone(),
                cluster_id: r.cluster_id.clone(),
                distance: cosine_distance(embedding, &r.embedding),
            })
            .filter(|m| m.distance <= max_distance)
            .collect();

        matches.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_unequal_lengths() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Fed raises rates").await.unwrap();
        let b = embedder.embed("Fed raises rates").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("fed raises interest rates").await.unwrap();
        let b = embedder.embed("fed hikes interest rates").await.unwrap();
        let c = embedder.embed("dolphin migration patterns atlantic").await.unwrap();

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn store_search_filters_and_ranks() {
        let embedder = HashingEmbedder::default();
        let store = InMemoryVectorStore::new();

        for (id, cluster, category, text) in [
            ("a-1", "c-1", "MACRO", "fed raises interest rates again"),
            ("a-2", "c-1", "MACRO", "fed hikes interest rates"),
            ("a-3", "c-2", "CRYPTO", "bitcoin etf approval imminent"),
        ] {
            store
                .upsert(VectorRecord {
                    article_id: id.into(),
                    cluster_id: cluster.into(),
                    category: category.into(),
                    embedding: embedder.embed(text).await.unwrap(),
                })
                .await
                .unwrap();
        }

        let query = embedder.embed("fed raises rates").await.unwrap();
        let hits = store.search(&query, 8, 1.0, Some("MACRO")).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.cluster_id == "c-1"));
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = InMemoryVectorStore::new();
        let record = VectorRecord {
            article_id: "a-1".into(),
            cluster_id: "c-1".into(),
            category: "MACRO".into(),
            embedding: vec![1.0; 4],
        };
        store.upsert(record.clone()).await.unwrap();
        store
            .upsert(VectorRecord {
                cluster_id: "c-2".into(),
                ..record
            })
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.cluster_of("a-1").as_deref(), Some("c-2"));
    }
}
