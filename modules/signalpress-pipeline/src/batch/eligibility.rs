use std::collections::HashSet;

use anyhow::Result;
use tracing::debug;

use signalpress_common::{Article, ItemId};
use signalpress_store::Store;

/// Which articles are worth analyzing.
#[derive(Debug, Clone, Default)]
pub struct EligibilityCriteria {
    /// Minimum trimmed content length, in characters.
    pub min_content_chars: usize,
    /// Items that already have a successful analysis.
    pub exclude: HashSet<ItemId>,
    pub limit: Option<usize>,
}

/// Filter and order candidates: long enough, not yet processed, newest first
/// (ties by ascending id), at most `limit`.
pub fn select_candidates(articles: &[Article], criteria: &EligibilityCriteria) -> Vec<ItemId> {
    let mut eligible: Vec<&Article> = articles
        .iter()
        .filter(|a| !criteria.exclude.contains(&a.id))
        .filter(|a| a.content.trim().chars().count() >= criteria.min_content_chars)
        .collect();

    eligible.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let limit = criteria.limit.unwrap_or(usize::MAX);
    eligible.into_iter().take(limit).map(|a| a.id).collect()
}

/// Load articles and the processed set from the store, then select.
pub async fn candidates(
    store: &dyn Store,
    min_content_chars: usize,
    limit: Option<usize>,
) -> Result<Vec<ItemId>> {
    let articles = store.list_articles().await?;
    let criteria = EligibilityCriteria {
        min_content_chars,
        exclude: store.processed_item_ids().await?,
        limit,
    };
    let selected = select_candidates(&articles, &criteria);
    debug!(
        articles = articles.len(),
        processed = criteria.exclude.len(),
        selected = selected.len(),
        "Eligibility filter applied"
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn article(id: ItemId, chars: usize, age_hours: i64) -> Article {
        let base = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        Article {
            id,
            title: format!("Article {id}"),
            url: format!("https://news.example/{id}"),
            content: "a".repeat(chars),
            published_at: base - Duration::hours(age_hours),
        }
    }

    #[test]
    fn short_and_processed_articles_are_excluded() {
        let articles = vec![article(1, 600, 0), article(2, 100, 0), article(3, 600, 0)];
        let criteria = EligibilityCriteria {
            min_content_chars: 500,
            exclude: HashSet::from([3]),
            limit: None,
        };
        assert_eq!(select_candidates(&articles, &criteria), vec![1]);
    }

    #[test]
    fn whitespace_does_not_count_toward_length() {
        let mut padded = article(1, 450, 0);
        padded.content = format!("   {}{}", padded.content, " ".repeat(100));
        let criteria = EligibilityCriteria {
            min_content_chars: 500,
            ..Default::default()
        };
        assert!(select_candidates(&[padded], &criteria).is_empty());
    }

    #[test]
    fn newest_first_then_ascending_id() {
        let articles = vec![
            article(5, 600, 2),
            article(9, 600, 0),
            article(4, 600, 0),
            article(7, 600, 1),
        ];
        let criteria = EligibilityCriteria {
            min_content_chars: 500,
            limit: Some(3),
            ..Default::default()
        };
        assert_eq!(select_candidates(&articles, &criteria), vec![4, 9, 7]);
    }

    #[test]
    fn selection_is_idempotent() {
        let articles = vec![article(2, 700, 3), article(1, 700, 3)];
        let criteria = EligibilityCriteria {
            min_content_chars: 500,
            ..Default::default()
        };
        let first = select_candidates(&articles, &criteria);
        assert_eq!(first, select_candidates(&articles, &criteria));
        assert_eq!(first, vec![1, 2]);
    }
}
