use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::storage::Storage;

/// Splits free text into candidate keyword tokens.
pub trait Tokenizer: Send + Sync {
    fn tokens(&self, text: &str) -> Vec<String>;
}

/// Splits on anything that is not alphanumeric and lowercases the rest.
/// Unicode-aware, so Hangul query terms survive intact. Swap in a
/// morphological analyzer for better candidate extraction.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokens(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(|token| token.to_lowercase())
            .collect()
    }
}

pub struct TrendAggregator {
    storage: Arc<Storage>,
    tokenizer: Box<dyn Tokenizer>,
}

impl TrendAggregator {
    pub fn new(storage: Arc<Storage>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self { storage, tokenizer }
    }

    /// Appends one snapshot row per keyword, counting case-folded exact
    /// occurrences over the title+description text of the owner's articles
    /// published within `window`. Zero is a measurement and gets a row; an
    /// empty article selection is not, and appends nothing. Returns the
    /// number of rows appended.
    #[instrument(
        level = "DEBUG",
        skip(self, keywords),
        fields(keyword_count = keywords.len())
    )]
    pub async fn recompute(
        &self,
        owner_id: i64,
        keywords: &[String],
        window: Duration,
    ) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let cutoff = now - window;

        let mut tx = self.storage.begin().await?;
        let articles = tx.articles_for_trends(owner_id, cutoff).await?;

        if articles.is_empty() {
            debug!(owner_id, "No recent articles; skipping the trend cycle");
            tx.commit().await?;
            return Ok(0);
        }

        let mut text = String::new();
        for article in &articles {
            text.push_str(&article.title);
            text.push(' ');
            text.push_str(&article.description);
            text.push(' ');
        }

        let mut counts: HashMap<String, u64> = keywords
            .iter()
            .map(|keyword| (keyword.to_lowercase(), 0))
            .collect();

        for token in self.tokenizer.tokens(&text) {
            if let Some(count) = counts.get_mut(&token) {
                *count += 1;
            }
        }

        let rows: Vec<(String, u64)> = keywords
            .iter()
            .map(|keyword| {
                let count = counts.get(&keyword.to_lowercase()).copied().unwrap_or(0);

                (keyword.clone(), count)
            })
            .collect();

        tx.append_trends(owner_id, &rows, now).await?;
        tx.commit().await?;

        debug!(owner_id, article_count = articles.len(), "Recomputed trends");

        Ok(rows.len())
    }
}
