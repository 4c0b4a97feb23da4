// =============================================================================
// Title Pre-Clusterer — seed grouping by title-only similarity
// =============================================================================
//
// Greedy single pass: each article joins the first existing group whose
// representative title scores >= 0.70 token Jaccard against its own,
// otherwise it starts a new group. Group ids are transient; nothing is
// persisted. Downstream assignment uses the groups only as a tiebreaker hint.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use super::model::{title_fingerprint, Article};
use super::similarity::token_jaccard;

/// Title similarity required to join an existing group.
const TITLE_GROUP_THRESHOLD: f64 = 0.70;

/// One transient pre-group: a representative title and member article ids.
#[derive(Debug, Clone)]
pub struct TitleGroup {
    pub group_id: usize,
    pub representative: String,
    pub article_ids: Vec<String>,
}

/// Group a batch of articles by title-only similarity. Returns the groups
/// plus an article-id -> group-id index.
pub fn precluster_titles(articles: &[Article]) -> (Vec<TitleGroup>, HashMap<String, usize>) {
    let mut groups: Vec<TitleGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for article in articles {
        let fingerprint = title_fingerprint(&article.title);

        let joined = groups.iter_mut().find(|g| {
            token_jaccard(&g.representative, &fingerprint) >= TITLE_GROUP_THRESHOLD
        });

        match joined {
            Some(group) => {
                group.article_ids.push(article.id.clone());
                index.insert(article.id.clone(), group.group_id);
            }
            None => {
                let group_id = groups.len();
                groups.push(TitleGroup {
                    group_id,
                    representative: fingerprint,
                    article_ids: vec![article.id.clone()],
                });
                index.insert(article.id.clone(), group_id);
            }
        }
    }

    debug!(articles = articles.len(), groups = groups.len(), "title pre-clustering complete");
    (groups, index)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn article(id: &str, title: &str) -> Article {
        Article {
            id: id.into(),
            url: format!("https://example.com/{id}"),
            title: title.into(),
            content: String::new(),
            snippet: String::new(),
            source: "wire".into(),
            published_at: Utc::now(),
            language: "en".into(),
            categories: vec!["MACRO".into()],
            tags: vec![],
        }
    }

    #[test]
    fn near_identical_titles_group_together() {
        let articles = vec![
            article("a-1", "Fed raises interest rates by 25bps"),
            article("a-2", "Fed raises interest rates by 25bps today"),
            article("a-3", "Dolphin migration reaches Atlantic coast"),
        ];
        let (groups, index) = precluster_titles(&articles);
        assert_eq!(groups.len(), 2);
        assert_eq!(index["a-1"], index["a-2"]);
        assert_ne!(index["a-1"], index["a-3"]);
    }

    #[test]
    fn empty_batch_yields_no_groups() {
        let (groups, index) = precluster_titles(&[]);
        assert!(groups.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn every_article_is_indexed() {
        let articles: Vec<Article> = (0..10)
            .map(|i| article(&format!("a-{i}"), &format!("Completely unique headline number {i} zq{i}")))
            .collect();
        let (_, index) = precluster_titles(&articles);
        assert_eq!(index.len(), 10);
    }
}
