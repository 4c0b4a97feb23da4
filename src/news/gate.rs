// =============================================================================
// Ingestion Gate — filters before an article enters the pipeline
// =============================================================================
//
// Ordered checks, first block wins:
//   1. Non-market-moving title (lifestyle / listicle / opinion patterns)
//   2. Language not in the allow list
//   3. Minimum content quality (title and body length, shouting titles)
//
// Returns `None` when the article passes, `Some(reason)` when blocked.
// =============================================================================

use tracing::debug;

use super::model::Article;

/// Title fragments that mark an article as not market-moving.
const NON_MARKET_TITLE_PATTERNS: &[&str] = &[
    "horoscope",
    "celebrity",
    "recipe",
    "review:",
    "opinion:",
    "editorial:",
    "how to watch",
    "quiz",
    "crossword",
    "sponsored",
    "giveaway",
    "top 10",
    "top 5",
    "best of",
    "gift guide",
];

/// Minimum characters for a usable title.
const MIN_TITLE_LEN: usize = 12;
/// Minimum characters of body text (content or snippet).
const MIN_CONTENT_LEN: usize = 80;

pub struct IngestionGate {
    allowed_languages: Vec<String>,
}

impl IngestionGate {
    pub fn new(allowed_languages: Vec<String>) -> Self {
        Self { allowed_languages }
    }

    /// Evaluate every gate. Returns `None` if the article may proceed, or
    /// `Some(reason)` naming the first gate that blocked it.
    pub fn evaluate(&self, article: &Article) -> Option<String> {
        // ── Non-market-moving title ─────────────────────────────────────
        let title_lower = article.title.to_lowercase();
        if let Some(pattern) = NON_MARKET_TITLE_PATTERNS
            .iter()
            .find(|p| title_lower.contains(*p))
        {
            debug!(article_id = %article.id, pattern, "gate: non-market title");
            return Some(format!("non-market-moving title (matched '{pattern}')"));
        }

        // ── Language ────────────────────────────────────────────────────
        if !self
            .allowed_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&article.language))
        {
            debug!(article_id = %article.id, language = %article.language, "gate: language");
            return Some(format!("language '{}' not allowed", article.language));
        }

        // ── Quality ─────────────────────────────────────────────────────
        if article.title.trim().len() < MIN_TITLE_LEN {
            return Some("title too short".to_string());
        }
        let body_len = article.content.len().max(article.snippet.len());
        if body_len < MIN_CONTENT_LEN {
            return Some("content too short".to_string());
        }
        // All-caps titles are ads or shouting, not reporting.
        let letters: Vec<char> = article.title.chars().filter(|c| c.is_alphabetic()).collect();
        if !letters.is_empty() {
            let upper = letters.iter().filter(|c| c.is_uppercase()).count();
            if upper as f64 / letters.len() as f64 > 0.9 {
                return Some("title is mostly uppercase".to_string());
            }
        }

        None
    }
}

impl Default for IngestionGate {
    fn default() -> Self {
        Self::new(vec!["en".to_string()])
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn article(title: &str, language: &str, content: &str) -> Article {
        Article {
            id: "a-1".into(),
            url: "https://example.com/1".into(),
            title: title.into(),
            content: content.into(),
            snippet: String::new(),
            source: "wire".into(),
            published_at: Utc::now(),
            language: language.into(),
            categories: vec!["MACRO".into()],
            tags: vec![],
        }
    }

    const BODY: &str = "The Federal Reserve raised its benchmark interest rate by 25 basis \
                        points on Wednesday, citing persistent inflation pressure.";

    #[test]
    fn passes_a_normal_article() {
        let gate = IngestionGate::default();
        assert!(gate.evaluate(&article("Fed Raises Rates by 25bps", "en", BODY)).is_none());
    }

    #[test]
    fn blocks_non_market_titles() {
        let gate = IngestionGate::default();
        let reason = gate
            .evaluate(&article("Top 10 Celebrity Yachts of 2026", "en", BODY))
            .unwrap();
        assert!(reason.contains("non-market-moving"));
    }

    #[test]
    fn blocks_disallowed_language() {
        let gate = IngestionGate::default();
        let reason = gate
            .evaluate(&article("Fed Raises Rates by 25bps", "de", BODY))
            .unwrap();
        assert!(reason.contains("language"));
    }

    #[test]
    fn blocks_thin_content() {
        let gate = IngestionGate::default();
        assert!(gate.evaluate(&article("Fed Raises Rates by 25bps", "en", "short")).is_some());
        assert!(gate.evaluate(&article("Short", "en", BODY)).is_some());
    }

    #[test]
    fn blocks_shouting_title() {
        let gate = IngestionGate::default();
        assert!(gate
            .evaluate(&article("BUY BITCOIN NOW BEFORE IT MOONS", "en", BODY))
            .is_some());
    }
}
