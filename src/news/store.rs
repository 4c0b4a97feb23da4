// =============================================================================
// Story Cluster Store — persistence seam for clusters, links, heat, entities
// =============================================================================
//
// The store is the consistency oracle of the clustering engine: concurrent
// batch workers serialize through it, and (topic_key, category) uniqueness is
// enforced by find-or-create semantics. The in-memory implementation backs
// offline operation and tests; a database implements the same trait in
// production.
// =============================================================================

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    Article, ClusterArticleLink, CrossRef, CrossRefRelation, EntityType, ExtractedEntity,
    HeatSample, StoryCluster, Urgency,
};

/// Keyword list cap on a cluster row.
const CLUSTER_KEYWORD_CAP: usize = 20;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StoryClusterStore: Send + Sync {
    // ── Articles (append-only) ──────────────────────────────────────────
    /// Insert an article; returns false if the id already exists.
    async fn insert_article(&self, article: &Article) -> anyhow::Result<bool>;
    async fn get_article(&self, id: &str) -> anyhow::Result<Option<Article>>;

    // ── Clusters ────────────────────────────────────────────────────────
    async fn get_cluster(&self, id: &str) -> anyhow::Result<Option<StoryCluster>>;
    async fn find_by_topic_key(
        &self,
        topic_key: &str,
        category: &str,
    ) -> anyhow::Result<Option<StoryCluster>>;
    /// Insert `cluster` unless a cluster with the same (topic_key, category)
    /// exists; returns the stored row either way (find-or-create).
    async fn find_or_create_cluster(&self, cluster: StoryCluster)
        -> anyhow::Result<StoryCluster>;
    async fn update_cluster(&self, cluster: &StoryCluster) -> anyhow::Result<()>;
    async fn delete_cluster(&self, id: &str) -> anyhow::Result<()>;
    /// Clusters updated within `within`, hottest first, optionally scoped to
    /// one category.
    async fn recent_clusters(
        &self,
        category: Option<&str>,
        within: chrono::Duration,
        limit: usize,
    ) -> anyhow::Result<Vec<StoryCluster>>;
    async fn hottest_clusters(&self, limit: usize) -> anyhow::Result<Vec<StoryCluster>>;
    async fn all_clusters(&self) -> anyhow::Result<Vec<StoryCluster>>;

    // ── Article links ───────────────────────────────────────────────────
    /// Add a link; returns false if (cluster_id, article_id) already exists.
    async fn add_article_link(&self, link: ClusterArticleLink) -> anyhow::Result<bool>;
    /// Add a link and refresh the owning cluster in one store transaction:
    /// article/unique-title counts recomputed from the link table, heat
    /// bumped by the link's contribution, urgency raised to `urgency` if
    /// higher, `keywords` merged (capped), `updated_at` advanced. Returns
    /// false (and changes nothing) when the link already exists.
    async fn link_article_and_update(
        &self,
        link: ClusterArticleLink,
        urgency: Urgency,
        keywords: &[String],
    ) -> anyhow::Result<bool>;
    async fn links_for_cluster(&self, cluster_id: &str)
        -> anyhow::Result<Vec<ClusterArticleLink>>;
    /// Repoint every link of `from` at `to` (merge support); links whose
    /// article already links `to` are dropped. Returns the moved count.
    async fn move_links(&self, from: &str, to: &str) -> anyhow::Result<u32>;

    // ── Heat history ────────────────────────────────────────────────────
    async fn append_heat_sample(&self, sample: HeatSample) -> anyhow::Result<()>;
    /// Most recent `limit` samples, newest first.
    async fn heat_history(&self, cluster_id: &str, limit: usize)
        -> anyhow::Result<Vec<HeatSample>>;

    // ── Cross references ────────────────────────────────────────────────
    /// Add an edge; returns false if (a, b, relation) already exists.
    async fn add_cross_ref(&self, cross_ref: CrossRef) -> anyhow::Result<bool>;
    async fn cross_refs(&self, cluster_id: &str) -> anyhow::Result<Vec<CrossRef>>;

    // ── Entities ────────────────────────────────────────────────────────
    /// Resolve or mint the entity row for (type, normalized); returns its id.
    async fn find_or_create_entity(&self, entity: &ExtractedEntity) -> anyhow::Result<String>;
    async fn link_entity_article(
        &self,
        entity_id: &str,
        article_id: &str,
        confidence: f64,
    ) -> anyhow::Result<()>;
    async fn bump_entity_cluster_heat(
        &self,
        entity_id: &str,
        cluster_id: &str,
        delta: f64,
    ) -> anyhow::Result<()>;
    async fn entity_cluster_heat(
        &self,
        entity_id: &str,
        cluster_id: &str,
    ) -> anyhow::Result<f64>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct EntityRow {
    id: String,
    #[allow(dead_code)]
    name: String,
}

#[derive(Default)]
struct Inner {
    articles: HashMap<String, Article>,
    clusters: HashMap<String, StoryCluster>,
    /// (category, topic_key) -> cluster id.
    topic_index: HashMap<(String, String), String>,
    links: Vec<ClusterArticleLink>,
    link_keys: HashSet<(String, String)>,
    heat: HashMap<String, Vec<HeatSample>>,
    cross_refs: Vec<CrossRef>,
    cross_ref_keys: HashSet<(String, String, CrossRefRelation)>,
    entities: HashMap<(EntityType, String), EntityRow>,
    entity_articles: HashMap<(String, String), f64>,
    entity_cluster_heat: HashMap<(String, String), f64>,
}

pub struct InMemoryClusterStore {
    inner: RwLock<Inner>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.inner.read().clusters.len()
    }

    pub fn link_count(&self) -> usize {
        self.inner.read().links.len()
    }
}

impl Default for InMemoryClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoryClusterStore for InMemoryClusterStore {
    // ── Articles ────────────────────────────────────────────────────────

    async fn insert_article(&self, article: &Article) -> anyhow::Result<bool> {
        let mut inner = self.inner.write();
        if inner.articles.contains_key(&article.id) {
            return Ok(false);
        }
        inner.articles.insert(article.id.clone(), article.clone());
        Ok(true)
    }

    async fn get_article(&self, id: &str) -> anyhow::Result<Option<Article>> {
        Ok(self.inner.read().articles.get(id).cloned())
    }

    // ── Clusters ────────────────────────────────────────────────────────

    async fn get_cluster(&self, id: &str) -> anyhow::Result<Option<StoryCluster>> {
        Ok(self.inner.read().clusters.get(id).cloned())
    }

    async fn find_by_topic_key(
        &self,
        topic_key: &str,
        category: &str,
    ) -> anyhow::Result<Option<StoryCluster>> {
        let inner = self.inner.read();
        Ok(inner
            .topic_index
            .get(&(category.to_string(), topic_key.to_string()))
            .and_then(|id| inner.clusters.get(id))
            .cloned())
    }

    async fn find_or_create_cluster(
        &self,
        cluster: StoryCluster,
    ) -> anyhow::Result<StoryCluster> {
        let mut inner = self.inner.write();
        let key = (cluster.category.clone(), cluster.topic_key.clone());

        if let Some(existing_id) = inner.topic_index.get(&key) {
            let existing = inner
                .clusters
                .get(existing_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("topic index points at missing cluster"))?;
            debug!(
                topic_key = %cluster.topic_key,
                category = %cluster.category,
                existing_id = %existing.id,
                "find_or_create: existing cluster returned"
            );
            return Ok(existing);
        }

        inner.topic_index.insert(key, cluster.id.clone());
        inner.clusters.insert(cluster.id.clone(), cluster.clone());
        info!(
            cluster_id = %cluster.id,
            topic_key = %cluster.topic_key,
            category = %cluster.category,
            "cluster created"
        );
        Ok(cluster)
    }

    async fn update_cluster(&self, cluster: &StoryCluster) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if !inner.clusters.contains_key(&cluster.id) {
            anyhow::bail!("cluster {} does not exist", cluster.id);
        }
        inner
            .clusters
            .insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if let Some(cluster) = inner.clusters.remove(id) {
            let key = (cluster.category.clone(), cluster.topic_key.clone());
            // The index entry may already point at a survivor (merge flows
            // rewrite topic keys); only remove it when it names this cluster.
            if inner.topic_index.get(&key).map(String::as_str) == Some(id) {
                inner.topic_index.remove(&key);
            }
            info!(cluster_id = %id, topic_key = %cluster.topic_key, "cluster deleted");
        } else {
            warn!(cluster_id = %id, "delete of unknown cluster ignored");
        }
        Ok(())
    }

    async fn recent_clusters(
        &self,
        category: Option<&str>,
        within: chrono::Duration,
        limit: usize,
    ) -> anyhow::Result<Vec<StoryCluster>> {
        let cutoff = Utc::now() - within;
        let inner = self.inner.read();
        let mut clusters: Vec<StoryCluster> = inner
            .clusters
            .values()
            .filter(|c| c.updated_at >= cutoff)
            .filter(|c| category.map(|cat| c.category == cat).unwrap_or(true))
            .cloned()
            .collect();
        clusters.sort_by(|a, b| {
            b.heat_score
                .partial_cmp(&a.heat_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        clusters.truncate(limit);
        Ok(clusters)
    }

    async fn hottest_clusters(&self, limit: usize) -> anyhow::Result<Vec<StoryCluster>> {
        let inner = self.inner.read();
        let mut clusters: Vec<StoryCluster> = inner.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| {
            b.heat_score
                .partial_cmp(&a.heat_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        clusters.truncate(limit);
        Ok(clusters)
    }

    async fn all_clusters(&self) -> anyhow::Result<Vec<StoryCluster>> {
        Ok(self.inner.read().clusters.values().cloned().collect())
    }

    // ── Article links ───────────────────────────────────────────────────

    async fn add_article_link(&self, link: ClusterArticleLink) -> anyhow::Result<bool> {
        let mut inner = self.inner.write();
        let key = (link.cluster_id.clone(), link.article_id.clone());
        if !inner.link_keys.insert(key) {
            debug!(
                cluster_id = %link.cluster_id,
                article_id = %link.article_id,
                "duplicate article link ignored"
            );
            return Ok(false);
        }
        inner.links.push(link);
        Ok(true)
    }

    async fn link_article_and_update(
        &self,
        link: ClusterArticleLink,
        urgency: Urgency,
        keywords: &[String],
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.write();
        let key = (link.cluster_id.clone(), link.article_id.clone());
        if inner.link_keys.contains(&key) {
            debug!(
                cluster_id = %link.cluster_id,
                article_id = %link.article_id,
                "duplicate article link ignored"
            );
            return Ok(false);
        }
        if !inner.clusters.contains_key(&link.cluster_id) {
            anyhow::bail!("cluster {} does not exist", link.cluster_id);
        }

        inner.link_keys.insert(key);
        inner.links.push(link.clone());

        let (article_count, unique_title_count) = {
            let mut distinct: HashSet<&str> = HashSet::new();
            let mut count = 0u32;
            for l in inner.links.iter().filter(|l| l.cluster_id == link.cluster_id) {
                count += 1;
                distinct.insert(l.title_fingerprint.as_str());
            }
            (count, distinct.len() as u32)
        };

        let cluster = inner
            .clusters
            .get_mut(&link.cluster_id)
            .ok_or_else(|| anyhow::anyhow!("cluster vanished mid-update"))?;
        cluster.article_count = article_count;
        cluster.unique_title_count = unique_title_count;
        cluster.heat_score += link.heat_contribution;
        cluster.urgency = cluster.urgency.max(urgency);
        cluster.updated_at = Utc::now();
        for kw in keywords {
            if !cluster.keywords.iter().any(|k| k.eq_ignore_ascii_case(kw)) {
                cluster.keywords.push(kw.clone());
            }
        }
        cluster.keywords.truncate(CLUSTER_KEYWORD_CAP);

        Ok(true)
    }

    async fn links_for_cluster(
        &self,
        cluster_id: &str,
    ) -> anyhow::Result<Vec<ClusterArticleLink>> {
        Ok(self
            .inner
            .read()
            .links
            .iter()
            .filter(|l| l.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn move_links(&self, from: &str, to: &str) -> anyhow::Result<u32> {
        let mut inner = self.inner.write();
        let mut moved = 0u32;
        let mut kept: Vec<ClusterArticleLink> = Vec::with_capacity(inner.links.len());

        let links = std::mem::take(&mut inner.links);
        for mut link in links {
            if link.cluster_id == from {
                let target_key = (to.to_string(), link.article_id.clone());
                inner.link_keys.remove(&(from.to_string(), link.article_id.clone()));
                if inner.link_keys.insert(target_key) {
                    link.cluster_id = to.to_string();
                    moved += 1;
                    kept.push(link);
                }
                // Already linked to the target: drop the duplicate.
            } else {
                kept.push(link);
            }
        }
        inner.links = kept;
        debug!(from, to, moved, "article links moved");
        Ok(moved)
    }

    // ── Heat history ────────────────────────────────────────────────────

    async fn append_heat_sample(&self, sample: HeatSample) -> anyhow::Result<()> {
        self.inner
            .write()
            .heat
            .entry(sample.cluster_id.clone())
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn heat_history(
        &self,
        cluster_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HeatSample>> {
        let inner = self.inner.read();
        let samples = match inner.heat.get(cluster_id) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        // Stored in append order; return newest first.
        Ok(samples.iter().rev().take(limit).cloned().collect())
    }

    // ── Cross references ────────────────────────────────────────────────

    async fn add_cross_ref(&self, cross_ref: CrossRef) -> anyhow::Result<bool> {
        let mut inner = self.inner.write();
        let key = (
            cross_ref.cluster_a.clone(),
            cross_ref.cluster_b.clone(),
            cross_ref.relation,
        );
        if !inner.cross_ref_keys.insert(key) {
            return Ok(false);
        }
        inner.cross_refs.push(cross_ref);
        Ok(true)
    }

    async fn cross_refs(&self, cluster_id: &str) -> anyhow::Result<Vec<CrossRef>> {
        Ok(self
            .inner
            .read()
            .cross_refs
            .iter()
            .filter(|r| r.cluster_a == cluster_id || r.cluster_b == cluster_id)
            .cloned()
            .collect())
    }

    // ── Entities ────────────────────────────────────────────────────────

    async fn find_or_create_entity(&self, entity: &ExtractedEntity) -> anyhow::Result<String> {
        let mut inner = self.inner.write();
        let key = (entity.entity_type, entity.normalized.clone());
        if let Some(row) = inner.entities.get(&key) {
            return Ok(row.id.clone());
        }
        let id = Uuid::new_v4().to_string();
        inner.entities.insert(
            key,
            EntityRow {
                id: id.clone(),
                name: entity.name.clone(),
            },
        );
        Ok(id)
    }

    async fn link_entity_article(
        &self,
        entity_id: &str,
        article_id: &str,
        confidence: f64,
    ) -> anyhow::Result<()> {
        self.inner
            .write()
            .entity_articles
            .insert((entity_id.to_string(), article_id.to_string()), confidence);
        Ok(())
    }

    async fn bump_entity_cluster_heat(
        &self,
        entity_id: &str,
        cluster_id: &str,
        delta: f64,
    ) -> anyhow::Result<()> {
        *self
            .inner
            .write()
            .entity_cluster_heat
            .entry((entity_id.to_string(), cluster_id.to_string()))
            .or_insert(0.0) += delta;
        Ok(())
    }

    async fn entity_cluster_heat(
        &self,
        entity_id: &str,
        cluster_id: &str,
    ) -> anyhow::Result<f64> {
        Ok(self
            .inner
            .read()
            .entity_cluster_heat
            .get(&(entity_id.to_string(), cluster_id.to_string()))
            .copied()
            .unwrap_or(0.0))
    }
}

impl std::fmt::Debug for InMemoryClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InMemoryClusterStore")
            .field("clusters", &inner.clusters.len())
            .field("links", &inner.links.len())
            .field("articles", &inner.articles.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::model::{EntitySource, TrendDirection, Urgency};

    fn cluster(id: &str, topic_key: &str, category: &str, heat: f64) -> StoryCluster {
        let now = Utc::now();
        StoryCluster {
            id: id.into(),
            topic: topic_key.replace('_', " "),
            topic_key: topic_key.into(),
            summary: String::new(),
            category: category.into(),
            keywords: vec![],
            heat_score: heat,
            article_count: 1,
            unique_title_count: 1,
            trend_direction: TrendDirection::Neutral,
            urgency: Urgency::Medium,
            sub_event_type: None,
            first_seen: now,
            updated_at: now,
        }
    }

    fn link(cluster_id: &str, article_id: &str) -> ClusterArticleLink {
        ClusterArticleLink {
            cluster_id: cluster_id.into(),
            article_id: article_id.into(),
            title_fingerprint: format!("fp {article_id}"),
            heat_contribution: 1.0,
        }
    }

    #[tokio::test]
    async fn find_or_create_enforces_topic_key_uniqueness() {
        let store = InMemoryClusterStore::new();
        let first = store
            .find_or_create_cluster(cluster("c-1", "fed_raises_rates", "MACRO", 10.0))
            .await
            .unwrap();
        // Second create with the same (topic_key, category) returns the first.
        let second = store
            .find_or_create_cluster(cluster("c-2", "fed_raises_rates", "MACRO", 20.0))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.cluster_count(), 1);

        // Same topic key in another category is a distinct cluster.
        let other = store
            .find_or_create_cluster(cluster("c-3", "fed_raises_rates", "CRYPTO", 5.0))
            .await
            .unwrap();
        assert_eq!(other.id, "c-3");
    }

    #[tokio::test]
    async fn duplicate_article_links_are_ignored() {
        let store = InMemoryClusterStore::new();
        assert!(store.add_article_link(link("c-1", "a-1")).await.unwrap());
        assert!(!store.add_article_link(link("c-1", "a-1")).await.unwrap());
        assert_eq!(store.link_count(), 1);
    }

    #[tokio::test]
    async fn move_links_repoints_and_dedups() {
        let store = InMemoryClusterStore::new();
        store.add_article_link(link("c-src", "a-1")).await.unwrap();
        store.add_article_link(link("c-src", "a-2")).await.unwrap();
        // a-2 already links the target: moving it would duplicate.
        store.add_article_link(link("c-dst", "a-2")).await.unwrap();

        let moved = store.move_links("c-src", "c-dst").await.unwrap();
        assert_eq!(moved, 1);

        let dst_links = store.links_for_cluster("c-dst").await.unwrap();
        assert_eq!(dst_links.len(), 2);
        assert!(store.links_for_cluster("c-src").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_and_update_refreshes_counters_atomically() {
        let store = InMemoryClusterStore::new();
        let mut seed = cluster("c-1", "fed_raises_rates", "MACRO", 0.0);
        seed.article_count = 0;
        seed.unique_title_count = 0;
        store.find_or_create_cluster(seed).await.unwrap();

        let mut l1 = link("c-1", "a-1");
        l1.heat_contribution = 4.0;
        let mut l2 = link("c-1", "a-2");
        l2.title_fingerprint = "fp a-1".into(); // duplicate fingerprint
        l2.heat_contribution = 6.0;

        assert!(store
            .link_article_and_update(l1, Urgency::High, &["fed".into()])
            .await
            .unwrap());
        assert!(store
            .link_article_and_update(l2, Urgency::Low, &["rates".into()])
            .await
            .unwrap());

        let stored = store.get_cluster("c-1").await.unwrap().unwrap();
        assert_eq!(stored.article_count, 2);
        assert_eq!(stored.unique_title_count, 1);
        assert_eq!(stored.urgency, Urgency::High);
        assert!(stored.keywords.contains(&"fed".to_string()));

        // Heat rebuild: the cluster's heat equals the sum of its link
        // contributions.
        let links = store.links_for_cluster("c-1").await.unwrap();
        let rebuilt: f64 = links.iter().map(|l| l.heat_contribution).sum();
        assert!((stored.heat_score - rebuilt).abs() < 1e-9);
    }

    #[tokio::test]
    async fn link_and_update_ignores_duplicates() {
        let store = InMemoryClusterStore::new();
        store
            .find_or_create_cluster(cluster("c-1", "fed_raises_rates", "MACRO", 0.0))
            .await
            .unwrap();

        let mut l = link("c-1", "a-1");
        l.heat_contribution = 4.0;
        assert!(store
            .link_article_and_update(l.clone(), Urgency::Medium, &[])
            .await
            .unwrap());
        assert!(!store
            .link_article_and_update(l, Urgency::Medium, &[])
            .await
            .unwrap());

        let stored = store.get_cluster("c-1").await.unwrap().unwrap();
        assert_eq!(stored.article_count, 1);
        assert!((stored.heat_score - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_frees_topic_key() {
        let store = InMemoryClusterStore::new();
        store
            .find_or_create_cluster(cluster("c-1", "fed_raises_rates", "MACRO", 10.0))
            .await
            .unwrap();
        store.delete_cluster("c-1").await.unwrap();
        assert!(store
            .find_by_topic_key("fed_raises_rates", "MACRO")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn heat_history_newest_first() {
        let store = InMemoryClusterStore::new();
        for i in 0..5 {
            store
                .append_heat_sample(HeatSample {
                    cluster_id: "c-1".into(),
                    timestamp: Utc::now(),
                    heat_score: i as f64,
                    article_count: i,
                    unique_title_count: i,
                    velocity: None,
                })
                .await
                .unwrap();
        }
        let history = store.heat_history("c-1", 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!((history[0].heat_score - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cross_refs_unique_on_triple() {
        let store = InMemoryClusterStore::new();
        let edge = CrossRef {
            cluster_a: "c-1".into(),
            cluster_b: "c-2".into(),
            relation: CrossRefRelation::MergedInto,
            score: 0.9,
        };
        assert!(store.add_cross_ref(edge.clone()).await.unwrap());
        assert!(!store.add_cross_ref(edge.clone()).await.unwrap());
        // A different relation between the same pair is a new edge.
        assert!(store
            .add_cross_ref(CrossRef {
                relation: CrossRefRelation::Related,
                ..edge
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn entities_resolve_to_stable_ids() {
        let store = InMemoryClusterStore::new();
        let entity = ExtractedEntity {
            name: "Federal Reserve".into(),
            normalized: "federal reserve".into(),
            entity_type: EntityType::GovernmentBody,
            confidence: 0.9,
            source: EntitySource::Regex,
        };
        let id1 = store.find_or_create_entity(&entity).await.unwrap();
        let id2 = store.find_or_create_entity(&entity).await.unwrap();
        assert_eq!(id1, id2);

        store.bump_entity_cluster_heat(&id1, "c-1", 0.5).await.unwrap();
        store.bump_entity_cluster_heat(&id1, "c-1", 0.25).await.unwrap();
        assert!((store.entity_cluster_heat(&id1, "c-1").await.unwrap() - 0.75).abs() < 1e-12);
    }

    #[tokio::test]
    async fn articles_are_append_only() {
        let store = InMemoryClusterStore::new();
        let article = Article {
            id: "a-1".into(),
            url: "https://example.com/1".into(),
            title: "Fed Raises Rates".into(),
            content: String::new(),
            snippet: String::new(),
            source: "wire".into(),
            published_at: Utc::now(),
            language: "en".into(),
            categories: vec!["MACRO".into()],
            tags: vec![],
        };
        assert!(store.insert_article(&article).await.unwrap());
        assert!(!store.insert_article(&article).await.unwrap());
    }
}
