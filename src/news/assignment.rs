// =============================================================================
// Cluster Assignment Engine — maps each article to a story cluster
// =============================================================================
//
// Ordered, short-circuiting tiers per article:
//
//   1. Topic-key match        — exact (topic_key, category) lookup
//   2. Vector similarity vote — top-8 nearest articles vote by cluster
//   3. Semantic fallback      — weighted similarity vs recent clusters
//   4. Existence validation   — candidate ids are checked against the store;
//                               stale ids are memoized per batch
//   5. Keyword Jaccard        — tags + long title words vs cluster keywords
//   6. Create new cluster     — find-or-create keyed by (topic_key, category)
//
// Articles are processed in parallel batches; all writes serialize through
// the store (the store is the consistency oracle). A failure in one
// article's compound write path is logged and skips that article only.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    enhanced_heat, title_fingerprint, AiLabel, Article, ClusterArticleLink, ExtractedEntity,
    HeatSample, StoryCluster,
};
use super::precluster::precluster_titles;
use super::similarity::{jaccard, ArticleFeatures, SemanticSimilarityService};
use super::store::StoryClusterStore;
use super::vector::{VectorRecord, VectorStore};

// ---------------------------------------------------------------------------
// Configuration & types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Maximum cosine distance for a vector vote to count.
    pub vector_distance_threshold: f64,
    /// Scope vector search to the article's primary category.
    pub vector_filter_by_category: bool,
    /// Enable Phase 0 title pre-clustering and the semantic fallback tier.
    pub enhanced_semantic: bool,
    /// Articles assigned concurrently per inner batch.
    pub batch_size: usize,
    /// Minimum weighted similarity for the semantic fallback tier.
    pub semantic_threshold: f64,
    /// Minimum Jaccard for the keyword fallback tier.
    pub keyword_threshold: f64,
    /// Only clusters updated within this window are assignment candidates.
    pub merge_window: chrono::Duration,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            vector_distance_threshold: 0.68,
            vector_filter_by_category: true,
            enhanced_semantic: true,
            batch_size: 20,
            semantic_threshold: 0.65,
            keyword_threshold: 0.55,
            merge_window: chrono::Duration::hours(48),
        }
    }
}

/// An article that passed quality + topic validation, with its label and
/// extracted entities.
#[derive(Debug, Clone)]
pub struct LabeledArticle {
    pub article: Article,
    pub label: AiLabel,
    pub entities: Vec<ExtractedEntity>,
}

/// Which tier produced the assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssignmentTier {
    TopicKey,
    VectorVote,
    Semantic,
    Keyword,
    NewCluster,
}

/// One article's assignment result.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentOutcome {
    pub article_id: String,
    pub cluster_id: String,
    pub created_new: bool,
    pub tier: AssignmentTier,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ClusterAssignmentEngine {
    store: Arc<dyn StoryClusterStore>,
    vector_store: Arc<dyn VectorStore>,
    similarity: Arc<SemanticSimilarityService>,
    config: AssignmentConfig,
}

/// Candidate clusters examined by the semantic and keyword fallback tiers.
const FALLBACK_CANDIDATE_LIMIT: usize = 100;
/// Nearest articles fetched for the vector vote.
const VECTOR_VOTE_TOP_K: usize = 8;
/// Fraction of an article's heat delta credited to each linked entity.
const ENTITY_HEAT_FRACTION: f64 = 0.1;

impl ClusterAssignmentEngine {
    pub fn new(
        store: Arc<dyn StoryClusterStore>,
        vector_store: Arc<dyn VectorStore>,
        similarity: Arc<SemanticSimilarityService>,
        config: AssignmentConfig,
    ) -> Self {
        Self {
            store,
            vector_store,
            similarity,
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Batch entry point
    // -------------------------------------------------------------------------

    /// Assign every article in the batch. Failed articles are logged and
    /// omitted from the result; the batch itself never aborts.
    pub async fn assign_batch(&self, batch: Vec<LabeledArticle>) -> Vec<AssignmentOutcome> {
        if batch.is_empty() {
            return Vec::new();
        }

        // Phase 0: transient title groups, used as a vote tiebreaker hint.
        let group_index = if self.config.enhanced_semantic {
            let articles: Vec<Article> = batch.iter().map(|l| l.article.clone()).collect();
            let (_, index) = precluster_titles(&articles);
            index
        } else {
            HashMap::new()
        };

        // Shared per-batch memo of vector-store cluster ids that turned out
        // not to exist, and of each title group's first adopted cluster.
        let missing_ids: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let group_hints: Arc<Mutex<HashMap<usize, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let mut outcomes = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(self.config.batch_size.max(1)) {
            let futures = chunk.iter().map(|labeled| {
                let group_id = group_index.get(&labeled.article.id).copied();
                self.assign_one(labeled, group_id, &missing_ids, &group_hints)
            });
            for (labeled, result) in chunk.iter().zip(join_all(futures).await) {
                match result {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        warn!(
                            article_id = %labeled.article.id,
                            error = %e,
                            "article assignment failed — skipping article"
                        );
                    }
                }
            }
        }

        info!(
            batch = batch.len(),
            assigned = outcomes.len(),
            created = outcomes.iter().filter(|o| o.created_new).count(),
            "cluster assignment batch complete"
        );
        outcomes
    }

    // -------------------------------------------------------------------------
    // Single-article assignment
    // -------------------------------------------------------------------------

    async fn assign_one(
        &self,
        labeled: &LabeledArticle,
        group_id: Option<usize>,
        missing_ids: &Arc<Mutex<HashSet<String>>>,
        group_hints: &Arc<Mutex<HashMap<usize, String>>>,
    ) -> anyhow::Result<AssignmentOutcome> {
        let article = &labeled.article;
        let label = &labeled.label;
        let category = article.primary_category().to_string();

        let mut adopted: Option<(StoryCluster, AssignmentTier)> = None;

        // ── Tier 1: topic-key match ─────────────────────────────────────
        if let Some(cluster) = self
            .store
            .find_by_topic_key(&label.topic_key, &category)
            .await?
        {
            debug!(article_id = %article.id, cluster_id = %cluster.id, "tier 1: topic-key match");
            adopted = Some((cluster, AssignmentTier::TopicKey));
        }

        // ── Tier 2: vector similarity vote ──────────────────────────────
        if adopted.is_none() && self.vector_store.is_available() {
            if let Some(cluster) = self
                .vector_vote(labeled, &category, group_id, missing_ids, group_hints)
                .await?
            {
                adopted = Some((cluster, AssignmentTier::VectorVote));
            }
        }

        // ── Tier 3: semantic similarity fallback ────────────────────────
        if adopted.is_none() && self.config.enhanced_semantic {
            if let Some(cluster) = self.semantic_fallback(labeled, &category).await? {
                adopted = Some((cluster, AssignmentTier::Semantic));
            }
        }

        // ── Tier 5: keyword Jaccard fallback ────────────────────────────
        // (Tier 4, existence validation, runs inside the vector vote where
        // stale candidate ids can appear.)
        if adopted.is_none() {
            if let Some(cluster) = self.keyword_fallback(labeled, &category).await? {
                adopted = Some((cluster, AssignmentTier::Keyword));
            }
        }

        // ── Tier 6: mint a new cluster ──────────────────────────────────
        let now = Utc::now();
        let heat_delta = enhanced_heat(article, label, now);
        let (cluster, tier, created_new) = match adopted {
            Some((cluster, tier)) => (cluster, tier, false),
            None => {
                // Counters and heat start at zero; the atomic link step below
                // brings them to 1 / 1 / the article's heat contribution.
                let fresh = StoryCluster {
                    id: Uuid::new_v4().to_string(),
                    topic: format_topic(&label.topic),
                    topic_key: label.topic_key.clone(),
                    summary: article.snippet.clone(),
                    category: category.clone(),
                    keywords: label.keywords.clone(),
                    heat_score: 0.0,
                    article_count: 0,
                    unique_title_count: 0,
                    trend_direction: label.trend_direction,
                    urgency: label.urgency,
                    sub_event_type: label.sub_event_type.clone(),
                    first_seen: now,
                    updated_at: now,
                };
                let stored = self.store.find_or_create_cluster(fresh.clone()).await?;
                let created = stored.id == fresh.id;
                if !created {
                    // Another worker won the (topic_key, category) race.
                    debug!(
                        article_id = %article.id,
                        cluster_id = %stored.id,
                        "new-cluster race resolved to existing cluster"
                    );
                }
                (stored, AssignmentTier::NewCluster, created)
            }
        };

        // Record the group's adopted cluster for tie-breaking batch-mates.
        if let Some(gid) = group_id {
            group_hints.lock().entry(gid).or_insert_with(|| cluster.id.clone());
        }

        // ── Post-assignment compound write ──────────────────────────────
        self.finalize_assignment(labeled, &cluster, heat_delta).await?;

        Ok(AssignmentOutcome {
            article_id: article.id.clone(),
            cluster_id: cluster.id,
            created_new,
            tier,
        })
    }

    // -------------------------------------------------------------------------
    // Tier 2: vector vote (with tier-4 existence validation inside)
    // -------------------------------------------------------------------------

    async fn vector_vote(
        &self,
        labeled: &LabeledArticle,
        category: &str,
        group_id: Option<usize>,
        missing_ids: &Arc<Mutex<HashSet<String>>>,
        group_hints: &Arc<Mutex<HashMap<usize, String>>>,
    ) -> anyhow::Result<Option<StoryCluster>> {
        let article = &labeled.article;
        let embedding = self
            .similarity
            .embedding_for(&article.id, &embedding_text(labeled))
            .await?;

        let matches = self
            .vector_store
            .search(
                &embedding,
                VECTOR_VOTE_TOP_K,
                self.config.vector_distance_threshold,
                self.config.vector_filter_by_category.then_some(category),
            )
            .await?;
        if matches.is_empty() {
            return Ok(None);
        }

        // Tally votes per cluster, remembering each cluster's best distance.
        let mut votes: HashMap<String, (u32, f64)> = HashMap::new();
        for m in &matches {
            let entry = votes.entry(m.cluster_id.clone()).or_insert((0, f64::MAX));
            entry.0 += 1;
            entry.1 = entry.1.min(m.distance);
        }

        let hint = group_id.and_then(|gid| group_hints.lock().get(&gid).cloned());
        let mut ranked: Vec<(String, u32, f64)> = votes
            .into_iter()
            .map(|(id, (count, dist))| (id, count, dist))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                // Tiebreaker 1: the title group's already-adopted cluster.
                .then_with(|| {
                    let a_hint = hint.as_deref() == Some(a.0.as_str());
                    let b_hint = hint.as_deref() == Some(b.0.as_str());
                    b_hint.cmp(&a_hint)
                })
                // Tiebreaker 2: closest match.
                .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        });

        for (cluster_id, vote_count, _) in ranked {
            if missing_ids.lock().contains(&cluster_id) {
                continue;
            }
            // Tier 4: a voted id may be stale (cluster merged away since the
            // vector row was written).
            match self.store.get_cluster(&cluster_id).await? {
                Some(cluster) if cluster.category == category => {
                    debug!(
                        article_id = %article.id,
                        cluster_id = %cluster.id,
                        votes = vote_count,
                        "tier 2: vector vote adopted"
                    );
                    return Ok(Some(cluster));
                }
                Some(_) => {
                    // Category mismatch: keep looking down the ranking.
                    continue;
                }
                None => {
                    warn!(cluster_id = %cluster_id, "vector store references missing cluster");
                    missing_ids.lock().insert(cluster_id);
                }
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Tier 3: semantic fallback
    // -------------------------------------------------------------------------

    async fn semantic_fallback(
        &self,
        labeled: &LabeledArticle,
        category: &str,
    ) -> anyhow::Result<Option<StoryCluster>> {
        let candidates = self
            .store
            .recent_clusters(Some(category), self.config.merge_window, FALLBACK_CANDIDATE_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let target = ArticleFeatures {
            article_id: labeled.article.id.clone(),
            embedding: self
                .similarity
                .embedding_for(&labeled.article.id, &embedding_text(labeled))
                .await?,
            entities: labeled.entities.clone(),
            topic: labeled.label.topic.clone(),
            keywords: labeled.label.keywords.clone(),
        };

        let mut candidate_features = Vec::with_capacity(candidates.len());
        for cluster in &candidates {
            let text = format!("{}. Keywords: {}", cluster.topic, cluster.keywords.join(", "));
            candidate_features.push(ArticleFeatures {
                article_id: format!("cluster:{}", cluster.id),
                embedding: self
                    .similarity
                    .embedding_for(&format!("cluster:{}", cluster.id), &text)
                    .await?,
                entities: Vec::new(),
                topic: cluster.topic.clone(),
                keywords: cluster.keywords.clone(),
            });
        }

        let ranked = self
            .similarity
            .find_most_similar(&target, &candidate_features, 1, self.config.semantic_threshold, true)
            .await;

        if let Some((index, score)) = ranked.first() {
            let cluster = candidates[*index].clone();
            debug!(
                article_id = %labeled.article.id,
                cluster_id = %cluster.id,
                score = score.score,
                "tier 3: semantic fallback adopted"
            );
            return Ok(Some(cluster));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Tier 5: keyword Jaccard fallback
    // -------------------------------------------------------------------------

    async fn keyword_fallback(
        &self,
        labeled: &LabeledArticle,
        category: &str,
    ) -> anyhow::Result<Option<StoryCluster>> {
        let candidates = self
            .store
            .recent_clusters(Some(category), self.config.merge_window, FALLBACK_CANDIDATE_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let article_terms = article_term_set(labeled);
        let mut best: Option<(f64, &StoryCluster)> = None;
        for cluster in &candidates {
            let cluster_terms = cluster_term_set(cluster);
            let score = jaccard(&article_terms, &cluster_terms);
            if score >= self.config.keyword_threshold
                && best.map(|(b, _)| score > b).unwrap_or(true)
            {
                best = Some((score, cluster));
            }
        }

        if let Some((score, cluster)) = best {
            debug!(
                article_id = %labeled.article.id,
                cluster_id = %cluster.id,
                score,
                "tier 5: keyword fallback adopted"
            );
            return Ok(Some(cluster.clone()));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Post-assignment compound write
    // -------------------------------------------------------------------------

    /// Link + counts + heat + vector upsert + entity links. Best-effort
    /// compound: the caller logs failures per article without aborting the
    /// batch.
    async fn finalize_assignment(
        &self,
        labeled: &LabeledArticle,
        cluster: &StoryCluster,
        heat_delta: f64,
    ) -> anyhow::Result<()> {
        let article = &labeled.article;
        let now = Utc::now();
        let fingerprint = title_fingerprint(&article.title);

        self.store.insert_article(article).await?;

        // Link + counter refresh happen in one store transaction so that
        // concurrent batch workers never write stale counts.
        self.store
            .link_article_and_update(
                ClusterArticleLink {
                    cluster_id: cluster.id.clone(),
                    article_id: article.id.clone(),
                    title_fingerprint: fingerprint,
                    heat_contribution: heat_delta,
                },
                labeled.label.urgency,
                &labeled.label.keywords,
            )
            .await?;

        // Heat history sample.
        if let Some(stored) = self.store.get_cluster(&cluster.id).await? {
            self.store
                .append_heat_sample(HeatSample {
                    cluster_id: stored.id.clone(),
                    timestamp: now,
                    heat_score: stored.heat_score,
                    article_count: stored.article_count,
                    unique_title_count: stored.unique_title_count,
                    velocity: None,
                })
                .await?;
        }

        // Vector upsert tagged with the cluster.
        if self.vector_store.is_available() {
            let embedding = self
                .similarity
                .embedding_for(&article.id, &embedding_text(labeled))
                .await?;
            self.vector_store
                .upsert(VectorRecord {
                    article_id: article.id.clone(),
                    cluster_id: cluster.id.clone(),
                    category: article.primary_category().to_string(),
                    embedding,
                })
                .await?;
        }

        // Entity rows, article links, and entity-cluster heat.
        for entity in &labeled.entities {
            let entity_id = self.store.find_or_create_entity(entity).await?;
            self.store
                .link_entity_article(&entity_id, &article.id, entity.confidence)
                .await?;
            self.store
                .bump_entity_cluster_heat(&entity_id, &cluster.id, heat_delta * ENTITY_HEAT_FRACTION)
                .await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for ClusterAssignmentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAssignmentEngine")
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Text embedded for vector search: topic + keywords, falling back to
/// title + summary/snippet when the label carries no topic.
fn embedding_text(labeled: &LabeledArticle) -> String {
    if !labeled.label.topic.trim().is_empty() {
        format!(
            "{}. Keywords: {}",
            labeled.label.topic,
            labeled.label.keywords.join(", ")
        )
    } else {
        format!("{}. {}", labeled.article.title, labeled.article.snippet)
    }
}

/// Words longer than this count as significant for the keyword tier.
const LONG_WORD_LEN: usize = 3;

fn article_term_set(labeled: &LabeledArticle) -> HashSet<String> {
    let mut terms: HashSet<String> = labeled.article.tags.iter().map(|t| t.to_lowercase()).collect();
    terms.extend(
        labeled
            .article
            .title
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > LONG_WORD_LEN)
            .map(String::from),
    );
    terms
}

fn cluster_term_set(cluster: &StoryCluster) -> HashSet<String> {
    let mut terms: HashSet<String> = cluster.keywords.iter().map(|k| k.to_lowercase()).collect();
    terms.extend(
        cluster
            .topic
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > LONG_WORD_LEN)
            .map(String::from),
    );
    terms
}

/// Human formatting for a minted cluster topic: trimmed, first letter
/// uppercased.
fn format_topic(topic: &str) -> String {
    let trimmed = topic.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
