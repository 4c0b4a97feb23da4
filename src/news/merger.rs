// =============================================================================
// Cluster Merger — collapse near-duplicate stories within a category
// =============================================================================
//
// For the top active clusters per category, every unordered pair is scored
// with EnhancedSimilarity:
//
//   factor               weight   participates when
//   topic_key identical   0.50    keys are identical
//   topic-word Jaccard    0.25    always (words longer than 3 chars)
//   keyword Jaccard       0.15    always
//   sub_event_type equal  0.10    both clusters carry one
//
// The raw sum is normalized by the participating weight. At >= 0.80 the
// cooler cluster merges into the hotter one: links move, counters refresh,
// the source is deleted, and a MERGED_INTO edge records the hierarchy. A
// merged-away cluster is never considered again within the pass.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::model::{CrossRef, CrossRefRelation, StoryCluster};
use super::similarity::jaccard;
use super::store::StoryClusterStore;

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

const WEIGHT_TOPIC_KEY: f64 = 0.50;
const WEIGHT_TOPIC_WORDS: f64 = 0.25;
const WEIGHT_KEYWORDS: f64 = 0.15;
const WEIGHT_SUB_EVENT: f64 = 0.10;

/// Words longer than this participate in the topic-word Jaccard.
const TOPIC_WORD_MIN_LEN: usize = 3;

/// EnhancedSimilarity between two clusters, in [0, 1].
pub fn enhanced_similarity(a: &StoryCluster, b: &StoryCluster) -> f64 {
    let mut score = 0.0;
    let mut used_weight = 0.0;

    // Topic-key identity only participates when it holds; a mismatch says
    // nothing (different phrasings of the same story key differently).
    if a.topic_key == b.topic_key {
        score += WEIGHT_TOPIC_KEY;
        used_weight += WEIGHT_TOPIC_KEY;
    }

    let words_a = topic_words(&a.topic);
    let words_b = topic_words(&b.topic);
    score += WEIGHT_TOPIC_WORDS * jaccard(&words_a, &words_b);
    used_weight += WEIGHT_TOPIC_WORDS;

    let kw_a: HashSet<String> = a.keywords.iter().map(|k| k.to_lowercase()).collect();
    let kw_b: HashSet<String> = b.keywords.iter().map(|k| k.to_lowercase()).collect();
    score += WEIGHT_KEYWORDS * jaccard(&kw_a, &kw_b);
    used_weight += WEIGHT_KEYWORDS;

    if let (Some(se_a), Some(se_b)) = (&a.sub_event_type, &b.sub_event_type) {
        if se_a.eq_ignore_ascii_case(se_b) {
            score += WEIGHT_SUB_EVENT;
        }
        used_weight += WEIGHT_SUB_EVENT;
    }

    if used_weight == 0.0 {
        return 0.0;
    }
    (score / used_weight).clamp(0.0, 1.0)
}

fn topic_words(topic: &str) -> HashSet<String> {
    topic
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > TOPIC_WORD_MIN_LEN)
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

/// One executed merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeRecord {
    pub source_id: String,
    pub target_id: String,
    pub score: f64,
}

pub struct ClusterMerger {
    store: Arc<dyn StoryClusterStore>,
    /// EnhancedSimilarity at or above which a pair merges.
    merge_threshold: f64,
    /// Only clusters updated within this window are considered.
    window: chrono::Duration,
    /// Active clusters examined per category.
    top_per_category: usize,
}

impl ClusterMerger {
    pub fn new(store: Arc<dyn StoryClusterStore>, window: chrono::Duration) -> Self {
        Self {
            store,
            merge_threshold: 0.80,
            window,
            top_per_category: 50,
        }
    }

    /// Run one merge pass over every category. Returns the executed merges.
    pub async fn run(&self) -> anyhow::Result<Vec<MergeRecord>> {
        let all = self.store.all_clusters().await?;
        let mut categories: HashMap<String, ()> = HashMap::new();
        for cluster in &all {
            categories.entry(cluster.category.clone()).or_insert(());
        }

        let mut merges = Vec::new();
        for category in categories.keys() {
            let clusters = self
                .store
                .recent_clusters(Some(category), self.window, self.top_per_category)
                .await?;
            merges.extend(self.merge_category(clusters).await?);
        }

        if !merges.is_empty() {
            info!(count = merges.len(), "cluster merge pass complete");
        }
        Ok(merges)
    }

    async fn merge_category(
        &self,
        clusters: Vec<StoryCluster>,
    ) -> anyhow::Result<Vec<MergeRecord>> {
        let mut merged_away: HashSet<String> = HashSet::new();
        let mut merges = Vec::new();

        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let (c1, c2) = (&clusters[i], &clusters[j]);
                if merged_away.contains(&c1.id) || merged_away.contains(&c2.id) {
                    continue;
                }

                let score = enhanced_similarity(c1, c2);
                if score < self.merge_threshold {
                    continue;
                }

                // Hotter cluster absorbs the cooler one.
                let (target, source) = if c1.heat_score >= c2.heat_score {
                    (c1, c2)
                } else {
                    (c2, c1)
                };

                self.merge_pair(target, source, score).await?;
                merged_away.insert(source.id.clone());
                merges.push(MergeRecord {
                    source_id: source.id.clone(),
                    target_id: target.id.clone(),
                    score,
                });
            }
        }
        Ok(merges)
    }

    /// Execute one merge: move links, refresh target counters, delete the
    /// source, record the hierarchy edge.
    async fn merge_pair(
        &self,
        target: &StoryCluster,
        source: &StoryCluster,
        score: f64,
    ) -> anyhow::Result<()> {
        let moved = self.store.move_links(&source.id, &target.id).await?;

        if let Some(mut stored) = self.store.get_cluster(&target.id).await? {
            let links = self.store.links_for_cluster(&target.id).await?;
            let distinct: HashSet<&str> =
                links.iter().map(|l| l.title_fingerprint.as_str()).collect();
            stored.article_count = links.len() as u32;
            // Unique-title counting is monotonic across merges: never below
            // what either side already reported.
            stored.unique_title_count = (distinct.len() as u32)
                .max(stored.unique_title_count)
                .max(target.unique_title_count);
            stored.heat_score += source.heat_score;
            stored.updated_at = chrono::Utc::now();
            for kw in &source.keywords {
                if !stored.keywords.iter().any(|k| k.eq_ignore_ascii_case(kw)) {
                    stored.keywords.push(kw.clone());
                }
            }
            stored.keywords.truncate(20);
            self.store.update_cluster(&stored).await?;
        }

        // Source is soft-deleted only after its links have moved.
        self.store.delete_cluster(&source.id).await?;

        self.store
            .add_cross_ref(CrossRef {
                cluster_a: source.id.clone(),
                cluster_b: target.id.clone(),
                relation: CrossRefRelation::MergedInto,
                score,
            })
            .await?;

        debug!(
            source_id = %source.id,
            target_id = %target.id,
            moved_links = moved,
            score,
            "clusters merged"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ClusterMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMerger")
            .field("merge_threshold", &self.merge_threshold)
            .field("top_per_category", &self.top_per_category)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::news::model::{ClusterArticleLink, TrendDirection, Urgency};
    use crate::news::store::InMemoryClusterStore;
    use chrono::Utc;

    fn cluster(id: &str, topic: &str, topic_key: &str, heat: f64) -> StoryCluster {
        let now = Utc::now();
        StoryCluster {
            id: id.into(),
            topic: topic.into(),
            topic_key: topic_key.into(),
            summary: String::new(),
            category: "MACRO".into(),
            keywords: vec!["fed".into(), "rates".into(), "hike".into()],
            heat_score: heat,
            article_count: 0,
            unique_title_count: 0,
            trend_direction: TrendDirection::Neutral,
            urgency: Urgency::Medium,
            sub_event_type: Some("rate_decision".into()),
            first_seen: now,
            updated_at: now,
        }
    }

    #[test]
    fn similarity_below_threshold_without_key_match() {
        // Different topic keys: the 0.50 factor does not participate.
        let a = cluster("c-a", "Fed raises rates", "fed_raises_rates", 80.0);
        let b = cluster("c-b", "Fed hikes rates", "fed_hikes_rates", 50.0);

        let score = enhanced_similarity(&a, &b);
        // topic words {raises, rates} vs {hikes, rates}: jaccard 1/3.
        // keywords identical: 1.0. sub event identical: 1.0.
        // (0.25/3 + 0.15 + 0.10) / 0.50 = 0.6667
        assert!((score - (0.25 / 3.0 + 0.25) / 0.50).abs() < 1e-9);
        assert!(score < 0.80);
    }

    #[test]
    fn identical_topic_key_pushes_over_threshold() {
        let a = cluster("c-a", "Fed raises rates", "fed_raises_rates", 80.0);
        let b = cluster("c-b", "Fed hikes rates", "fed_raises_rates", 50.0);

        let score = enhanced_similarity(&a, &b);
        // (0.50 + 0.25/3 + 0.15 + 0.10) / 1.0
        assert!((score - (0.50 + 0.25 / 3.0 + 0.25)).abs() < 1e-9);
        assert!(score >= 0.80);
    }

    async fn seed(store: &InMemoryClusterStore, c: StoryCluster, article_ids: &[&str]) {
        store.find_or_create_cluster(c.clone()).await.unwrap();
        for id in article_ids {
            store
                .link_article_and_update(
                    ClusterArticleLink {
                        cluster_id: c.id.clone(),
                        article_id: id.to_string(),
                        title_fingerprint: format!("fp {id}"),
                        heat_contribution: 0.0,
                    },
                    Urgency::Medium,
                    &[],
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn merge_moves_links_and_records_hierarchy() {
        let store = Arc::new(InMemoryClusterStore::new());
        // Same topic key so the pair clears the threshold; distinct store
        // keys via different categories is not needed — ids differ and the
        // topic index only guards find_or_create.
        let a = cluster("c-a", "Fed raises rates", "fed_raises_rates", 80.0);
        let mut b = cluster("c-b", "Fed hikes rates", "fed_hikes_rates", 50.0);
        seed(&store, a.clone(), &["a-1", "a-2"]).await;
        seed(&store, b.clone(), &["b-1"]).await;
        // Align the keys after seeding (find_or_create would have collapsed
        // identical keys at insert time).
        b.topic_key = "fed_raises_rates".into();
        b.heat_score = 50.0;
        store.update_cluster(&b).await.unwrap();

        let merger = ClusterMerger::new(store.clone(), chrono::Duration::hours(48));
        let merges = merger.run().await.unwrap();

        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].target_id, "c-a");
        assert_eq!(merges[0].source_id, "c-b");

        // Source gone, links moved, counts refreshed.
        assert!(store.get_cluster("c-b").await.unwrap().is_none());
        let target = store.get_cluster("c-a").await.unwrap().unwrap();
        assert_eq!(target.article_count, 3);
        assert_eq!(target.unique_title_count, 3);
        // Target heat absorbed the source's.
        assert!((target.heat_score - 130.0).abs() < 1e-9);

        // MERGED_INTO edge exists.
        let refs = store.cross_refs("c-b").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].relation, CrossRefRelation::MergedInto);
        assert_eq!(refs[0].cluster_b, "c-a");

        // Every pre-existing source link now belongs to the target.
        let target_links = store.links_for_cluster("c-a").await.unwrap();
        assert!(target_links.iter().any(|l| l.article_id == "b-1"));
    }

    #[tokio::test]
    async fn merged_cluster_not_reconsidered() {
        let store = Arc::new(InMemoryClusterStore::new());
        let a = cluster("c-a", "Fed raises rates", "fed_raises_rates", 80.0);
        let mut b = cluster("c-b", "Fed bumps rates", "fed_bumps_rates", 50.0);
        let mut c = cluster("c-c", "Fed lifts rates", "fed_lifts_rates", 20.0);
        seed(&store, a, &["a-1"]).await;
        seed(&store, b.clone(), &["b-1"]).await;
        seed(&store, c.clone(), &["c-1"]).await;
        b.topic_key = "fed_raises_rates".into();
        store.update_cluster(&b).await.unwrap();
        c.topic_key = "fed_raises_rates".into();
        store.update_cluster(&c).await.unwrap();

        let merger = ClusterMerger::new(store.clone(), chrono::Duration::hours(48));
        let merges = merger.run().await.unwrap();

        // Both cooler clusters merge into the hottest; no merge lists a
        // deleted cluster as its target.
        assert_eq!(merges.len(), 2);
        assert!(merges.iter().all(|m| m.target_id == "c-a"));
        let target = store.get_cluster("c-a").await.unwrap().unwrap();
        assert_eq!(target.article_count, 3);
    }

    #[tokio::test]
    async fn low_similarity_pairs_are_left_alone() {
        let store = Arc::new(InMemoryClusterStore::new());
        let mut a = cluster("c-a", "Fed raises rates", "fed_raises_rates", 80.0);
        a.keywords = vec!["fed".into(), "rates".into()];
        let mut b = cluster("c-b", "Bitcoin ETF approved", "bitcoin_etf_approved", 50.0);
        b.keywords = vec!["bitcoin".into(), "etf".into()];
        b.sub_event_type = Some("etf_approval".into());
        seed(&store, a, &["a-1"]).await;
        seed(&store, b, &["b-1"]).await;

        let merger = ClusterMerger::new(store.clone(), chrono::Duration::hours(48));
        let merges = merger.run().await.unwrap();
        assert!(merges.is_empty());
        assert_eq!(store.cluster_count(), 2);
    }
}
