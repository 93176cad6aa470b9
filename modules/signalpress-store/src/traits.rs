// Trait boundaries for persistence.
//
// Conditional transitions (claim, reset, finalize) are single store operations:
// the store checks the current status and applies the change atomically, so two
// workers can never both move the same record out of PENDING.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use signalpress_common::{
    Alert, AnalysisRecord, AnalyzedItem, Article, BatchRecord, BatchSession, GenerationProgress,
    ItemId, Newsletter, NewsletterKind, SessionStatus, SessionSummary, SignalRow, Usd,
    WindowMetrics,
};

// ---------------------------------------------------------------------------
// ArticleStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn list_articles(&self) -> Result<Vec<Article>>;

    async fn get_article(&self, id: ItemId) -> Result<Option<Article>>;

    /// Insert or replace an article. Used by ingestion and fixtures.
    async fn upsert_article(&self, article: &Article) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SessionStore: batch sessions and their per-item records
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session and all of its records in one unit of work.
    async fn create_session(&self, session: &BatchSession, records: &[BatchRecord]) -> Result<()>;

    async fn get_session(&self, id: Uuid) -> Result<Option<BatchSession>>;

    /// Sessions that have not been finalized yet.
    async fn live_sessions(&self) -> Result<Vec<BatchSession>>;

    /// Move a session to `next` if that is a forward transition. Returns whether it applied.
    async fn transition_session(
        &self,
        id: Uuid,
        next: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_truncated(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Bump `updated_at` so the stall detector sees activity.
    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn add_session_spend(&self, id: Uuid, amount: Usd, now: DateTime<Utc>) -> Result<()>;

    /// Write the summary and stamp `finalized_at`, once. The status is applied
    /// only if it is a forward transition. Returns false if already finalized.
    async fn finalize_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        summary: &SessionSummary,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn records_for_session(&self, session_id: Uuid) -> Result<Vec<BatchRecord>>;

    async fn get_record(&self, id: Uuid) -> Result<Option<BatchRecord>>;

    /// PENDING → IN_PROGRESS. Returns false if the record was not PENDING.
    async fn claim_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// IN_PROGRESS → PENDING without counting an attempt (the attempt never started).
    async fn release_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// IN_PROGRESS → FAILED, incrementing `attempt_count` and recording the error.
    async fn fail_record(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// PENDING or FAILED → ABANDONED. Returns the number of records changed.
    async fn abandon_records(&self, ids: &[Uuid], reason: &str, now: DateTime<Utc>) -> Result<u64>;

    /// FAILED → PENDING, for the recovery sweep. Returns false if the record moved on.
    async fn reset_failed_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Items that already have a successful analysis.
    async fn processed_item_ids(&self) -> Result<HashSet<ItemId>>;
}

// ---------------------------------------------------------------------------
// AnalysisStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// The single write path for a successful analysis: upserts the comprehensive
    /// row, replaces the item's signal rows, marks the record SUCCEEDED with its
    /// cost and adds `charged` to the session's spend, all in one unit of work.
    /// Returns false (writing nothing) if the record is no longer IN_PROGRESS.
    async fn record_analysis(
        &self,
        analysis: &AnalysisRecord,
        signals: &[SignalRow],
        charged: Usd,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AnalysisRecord>>;

    async fn signals_for_item(&self, item_id: ItemId) -> Result<Vec<SignalRow>>;

    /// Analyzed items (joined with article metadata) analyzed at or after `since`.
    async fn analyzed_items_since(&self, since: DateTime<Utc>) -> Result<Vec<AnalyzedItem>>;
}

// ---------------------------------------------------------------------------
// ProgressStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save_progress(&self, progress: &GenerationProgress) -> Result<()>;

    async fn load_progress(&self, task_id: Uuid) -> Result<Option<GenerationProgress>>;

    /// Runs still IN_PROGRESS.
    async fn active_progress(&self) -> Result<Vec<GenerationProgress>>;

    /// Delete terminal runs last updated before `cutoff`. Returns rows removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// NewsletterStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NewsletterStore: Send + Sync {
    async fn save_newsletter(&self, newsletter: &Newsletter) -> Result<()>;

    async fn find_newsletter(
        &self,
        kind: NewsletterKind,
        period_key: &str,
    ) -> Result<Option<Newsletter>>;

    async fn get_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>>;
}

// ---------------------------------------------------------------------------
// AlertStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persist an alert unless one with the same type and window key already
    /// exists at equal or higher severity. Returns true if it was stored.
    async fn insert_alert_if_new(&self, alert: &Alert) -> Result<bool>;

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>>;
}

// ---------------------------------------------------------------------------
// MetricsStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Aggregates over `[from, to)`: newsletter quality, run and record outcomes, spend.
    async fn window_metrics(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<WindowMetrics>;
}

/// Everything the pipeline needs from persistence.
pub trait Store:
    ArticleStore
    + SessionStore
    + AnalysisStore
    + ProgressStore
    + NewsletterStore
    + AlertStore
    + MetricsStore
{
}

impl<T> Store for T where
    T: ArticleStore
        + SessionStore
        + AnalysisStore
        + ProgressStore
        + NewsletterStore
        + AlertStore
        + MetricsStore
{
}
