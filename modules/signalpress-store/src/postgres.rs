//! Postgres-backed store.
//!
//! Enums are stored as their lowercase names, money as BIGINT micro-dollars.
//! Conditional transitions are a single `UPDATE ... WHERE status = ...`, or a
//! row lock inside a transaction where the check needs the status order.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use signalpress_common::{
    Alert, AlertSeverity, AnalysisRecord, AnalyzedItem, Article, BatchRecord, BatchSession,
    GenerationProgress, GenerationStatus, ItemId, Newsletter, NewsletterKind, SessionStatus,
    SessionSummary, SignalRow, Usd, WindowMetrics,
};

use crate::traits::{
    AlertStore, AnalysisStore, ArticleStore, MetricsStore, NewsletterStore, ProgressStore,
    SessionStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse<T: FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(|e: String| anyhow!(e))
}

fn usd(micros: i64) -> Usd {
    Usd::from_micros(micros.max(0) as u64)
}

fn micros(amount: Usd) -> i64 {
    i64::try_from(amount.micros()).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    status: String,
    budget_cap_micros: i64,
    budget_spent_micros: i64,
    batch_size: i32,
    item_ids: Vec<i64>,
    truncated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
    summary: Option<serde_json::Value>,
}

impl TryFrom<SessionRow> for BatchSession {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(BatchSession {
            id: row.id,
            status: parse(&row.status)?,
            budget_cap: usd(row.budget_cap_micros),
            budget_spent: usd(row.budget_spent_micros),
            batch_size: row.batch_size.max(0) as u32,
            item_ids: row.item_ids,
            truncated: row.truncated,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finalized_at: row.finalized_at,
            summary: row.summary.map(serde_json::from_value).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    session_id: Uuid,
    item_id: i64,
    attempt_count: i32,
    status: String,
    cost_micros: i64,
    last_error: Option<String>,
    last_attempted_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for BatchRecord {
    type Error = anyhow::Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(BatchRecord {
            id: row.id,
            session_id: row.session_id,
            item_id: row.item_id,
            attempt_count: row.attempt_count.max(0) as u32,
            status: parse(&row.status)?,
            cost: usd(row.cost_micros),
            last_error: row.last_error,
            last_attempted_at: row.last_attempted_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    item_id: i64,
    record_id: Uuid,
    session_id: Uuid,
    summary: String,
    signal_strength: f64,
    confidence: f64,
    themes: Vec<String>,
    cost_micros: i64,
    analyzed_at: DateTime<Utc>,
}

impl From<AnalysisRow> for AnalysisRecord {
    fn from(row: AnalysisRow) -> Self {
        AnalysisRecord {
            item_id: row.item_id,
            record_id: row.record_id,
            session_id: row.session_id,
            summary: row.summary,
            signal_strength: row.signal_strength,
            confidence: row.confidence,
            themes: row.themes,
            cost: usd(row.cost_micros),
            analyzed_at: row.analyzed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NewsletterRow {
    id: Uuid,
    kind: String,
    period_key: String,
    title: String,
    body: String,
    citations: serde_json::Value,
    quality_metrics: serde_json::Value,
    degradations: Vec<String>,
    task_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<NewsletterRow> for Newsletter {
    type Error = anyhow::Error;

    fn try_from(row: NewsletterRow) -> Result<Self> {
        Ok(Newsletter {
            id: row.id,
            kind: parse(&row.kind)?,
            period_key: row.period_key,
            title: row.title,
            body: row.body,
            citations: serde_json::from_value(row.citations)?,
            quality_metrics: serde_json::from_value(row.quality_metrics)?,
            degradations: row.degradations,
            task_id: row.task_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    alert_type: String,
    severity: String,
    generated_at: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    window_key: DateTime<Utc>,
    observed: f64,
    threshold: f64,
    context: serde_json::Value,
}

impl TryFrom<AlertRow> for Alert {
    type Error = anyhow::Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.id,
            alert_type: parse(&row.alert_type)?,
            severity: parse(&row.severity)?,
            generated_at: row.generated_at,
            window_start: row.window_start,
            window_end: row.window_end,
            window_key: row.window_key,
            observed: row.observed,
            threshold: row.threshold,
            context: row.context,
        })
    }
}

fn severity_rank(severity: AlertSeverity) -> i32 {
    match severity {
        AlertSeverity::Warning => 0,
        AlertSeverity::Critical => 1,
    }
}

const SESSION_COLUMNS: &str = "id, status, budget_cap_micros, budget_spent_micros, batch_size, \
     item_ids, truncated, created_at, updated_at, finalized_at, summary";

const RECORD_COLUMNS: &str = "id, session_id, item_id, attempt_count, status, cost_micros, \
     last_error, last_attempted_at, updated_at";

// ---------------------------------------------------------------------------
// ArticleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ArticleStore for PgStore {
    async fn list_articles(&self) -> Result<Vec<Article>> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, DateTime<Utc>)>(
            "SELECT id, title, url, content, published_at FROM articles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, title, url, content, published_at)| Article {
                id,
                title,
                url,
                content,
                published_at,
            })
            .collect())
    }

    async fn get_article(&self, id: ItemId) -> Result<Option<Article>> {
        let row = sqlx::query_as::<_, (i64, String, String, String, DateTime<Utc>)>(
            "SELECT id, title, url, content, published_at FROM articles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, title, url, content, published_at)| Article {
            id,
            title,
            url,
            content,
            published_at,
        }))
    }

    async fn upsert_article(&self, article: &Article) -> Result<()> {
        sqlx::query(
            "INSERT INTO articles (id, title, url, content, published_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                url = EXCLUDED.url,
                content = EXCLUDED.content,
                published_at = EXCLUDED.published_at",
        )
        .bind(article.id)
        .bind(&article.title)
        .bind(&article.url)
        .bind(&article.content)
        .bind(article.published_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, session: &BatchSession, records: &[BatchRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batch_sessions
                (id, status, budget_cap_micros, budget_spent_micros, batch_size, item_ids,
                 truncated, created_at, updated_at, finalized_at, summary)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(session.id)
        .bind(session.status.as_str())
        .bind(micros(session.budget_cap))
        .bind(micros(session.budget_spent))
        .bind(session.batch_size as i32)
        .bind(&session.item_ids)
        .bind(session.truncated)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.finalized_at)
        .bind(session.summary.as_ref().map(serde_json::to_value).transpose()?)
        .execute(&mut *tx)
        .await?;

        for (position, record) in records.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batch_records
                    (id, session_id, item_id, position, attempt_count, status, cost_micros,
                     last_error, last_attempted_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(record.id)
            .bind(record.session_id)
            .bind(record.item_id)
            .bind(position as i32)
            .bind(record.attempt_count as i32)
            .bind(record.status.as_str())
            .bind(micros(record.cost))
            .bind(&record.last_error)
            .bind(record.last_attempted_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<BatchSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM batch_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BatchSession::try_from).transpose()
    }

    async fn live_sessions(&self) -> Result<Vec<BatchSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM batch_sessions
             WHERE finalized_at IS NULL
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BatchSession::try_from).collect()
    }

    async fn transition_session(
        &self,
        id: Uuid,
        next: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, (String,)>(
            "SELECT status FROM batch_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((current,)) = current else {
            return Ok(false);
        };
        if !parse::<SessionStatus>(&current)?.can_transition_to(next) {
            return Ok(false);
        }

        sqlx::query("UPDATE batch_sessions SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(next.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_truncated(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE batch_sessions
             SET truncated = TRUE, updated_at = GREATEST(updated_at, $2)
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE batch_sessions SET updated_at = GREATEST(updated_at, $2) WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_session_spend(&self, id: Uuid, amount: Usd, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE batch_sessions
             SET budget_spent_micros = budget_spent_micros + $2,
                 updated_at = GREATEST(updated_at, $3)
             WHERE id = $1",
        )
        .bind(id)
        .bind(micros(amount))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        summary: &SessionSummary,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, (String, Option<DateTime<Utc>>)>(
            "SELECT status, finalized_at FROM batch_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((current, finalized_at)) = current else {
            return Ok(false);
        };
        if finalized_at.is_some() {
            return Ok(false);
        }
        let current: SessionStatus = parse(&current)?;
        let next = if current.can_transition_to(status) {
            status
        } else {
            current
        };

        sqlx::query(
            "UPDATE batch_sessions
             SET status = $2, summary = $3, finalized_at = $4, updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(next.as_str())
        .bind(serde_json::to_value(summary)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn records_for_session(&self, session_id: Uuid) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM batch_records
             WHERE session_id = $1
             ORDER BY position"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BatchRecord::try_from).collect()
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM batch_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BatchRecord::try_from).transpose()
    }

    async fn claim_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let claimed = sqlx::query_as::<_, (Uuid,)>(
            "UPDATE batch_records
             SET status = 'in_progress', last_attempted_at = $2, updated_at = $2
             WHERE id = $1 AND status = 'pending'
             RETURNING session_id",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((session_id,)) => {
                self.touch_session(session_id, now).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE batch_records SET status = 'pending', updated_at = $2
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_record(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let failed = sqlx::query_as::<_, (Uuid,)>(
            "UPDATE batch_records
             SET status = 'failed', attempt_count = attempt_count + 1,
                 last_error = $2, last_attempted_at = $3, updated_at = $3
             WHERE id = $1 AND status = 'in_progress'
             RETURNING session_id",
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match failed {
            Some((session_id,)) => {
                self.touch_session(session_id, now).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn abandon_records(&self, ids: &[Uuid], reason: &str, now: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE batch_records
             SET status = 'abandoned', last_error = $2, updated_at = $3
             WHERE id = ANY($1) AND status IN ('pending', 'failed')",
        )
        .bind(ids)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_failed_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let reset = sqlx::query_as::<_, (Uuid,)>(
            "UPDATE batch_records SET status = 'pending', updated_at = $2
             WHERE id = $1 AND status = 'failed'
             RETURNING session_id",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match reset {
            Some((session_id,)) => {
                self.touch_session(session_id, now).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn processed_item_ids(&self) -> Result<HashSet<ItemId>> {
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT item_id FROM analyses
             UNION
             SELECT item_id FROM batch_records WHERE status = 'succeeded'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// ---------------------------------------------------------------------------
// AnalysisStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AnalysisStore for PgStore {
    async fn record_analysis(
        &self,
        analysis: &AnalysisRecord,
        signals: &[SignalRow],
        charged: Usd,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE batch_records
             SET status = 'succeeded', attempt_count = attempt_count + 1,
                 cost_micros = $2, last_error = NULL, updated_at = $3
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(analysis.record_id)
        .bind(micros(analysis.cost))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO analyses
                (item_id, record_id, session_id, summary, signal_strength, confidence,
                 themes, cost_micros, analyzed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (item_id) DO UPDATE SET
                record_id = EXCLUDED.record_id,
                session_id = EXCLUDED.session_id,
                summary = EXCLUDED.summary,
                signal_strength = EXCLUDED.signal_strength,
                confidence = EXCLUDED.confidence,
                themes = EXCLUDED.themes,
                cost_micros = EXCLUDED.cost_micros,
                analyzed_at = EXCLUDED.analyzed_at",
        )
        .bind(analysis.item_id)
        .bind(analysis.record_id)
        .bind(analysis.session_id)
        .bind(&analysis.summary)
        .bind(analysis.signal_strength)
        .bind(analysis.confidence)
        .bind(&analysis.themes)
        .bind(micros(analysis.cost))
        .bind(analysis.analyzed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM analysis_signals WHERE item_id = $1")
            .bind(analysis.item_id)
            .execute(&mut *tx)
            .await?;

        for signal in signals {
            sqlx::query(
                "INSERT INTO analysis_signals (id, item_id, kind, text, strength)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(signal.id)
            .bind(signal.item_id)
            .bind(&signal.kind)
            .bind(&signal.text)
            .bind(signal.strength)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE batch_sessions
             SET budget_spent_micros = budget_spent_micros + $2,
                 updated_at = GREATEST(updated_at, $3)
             WHERE id = $1",
        )
        .bind(analysis.session_id)
        .bind(micros(charged))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query_as::<_, AnalysisRow>(
            "SELECT item_id, record_id, session_id, summary, signal_strength, confidence,
                    themes, cost_micros, analyzed_at
             FROM analyses WHERE item_id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AnalysisRecord::from))
    }

    async fn signals_for_item(&self, item_id: ItemId) -> Result<Vec<SignalRow>> {
        let rows = sqlx::query_as::<_, (Uuid, i64, String, String, f64)>(
            "SELECT id, item_id, kind, text, strength FROM analysis_signals
             WHERE item_id = $1 ORDER BY strength DESC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, item_id, kind, text, strength)| SignalRow {
                id,
                item_id,
                kind,
                text,
                strength,
            })
            .collect())
    }

    async fn analyzed_items_since(&self, since: DateTime<Utc>) -> Result<Vec<AnalyzedItem>> {
        let rows = sqlx::query_as::<
            _,
            (i64, String, String, String, f64, f64, Vec<String>, DateTime<Utc>),
        >(
            "SELECT a.item_id, ar.title, ar.url, a.summary, a.signal_strength, a.confidence,
                    a.themes, a.analyzed_at
             FROM analyses a
             JOIN articles ar ON ar.id = a.item_id
             WHERE a.analyzed_at >= $1
             ORDER BY a.item_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(item_id, title, url, summary, signal_strength, confidence, themes, analyzed_at)| {
                    AnalyzedItem {
                        item_id,
                        title,
                        url,
                        summary,
                        signal_strength,
                        confidence,
                        themes,
                        analyzed_at,
                    }
                },
            )
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ProgressStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ProgressStore for PgStore {
    async fn save_progress(&self, progress: &GenerationProgress) -> Result<()> {
        sqlx::query(
            "INSERT INTO generation_progress (task_id, kind, status, started_at, updated_at, doc)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (task_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                doc = EXCLUDED.doc",
        )
        .bind(progress.task_id)
        .bind(progress.kind.as_str())
        .bind(progress.status.as_str())
        .bind(progress.started_at)
        .bind(progress.updated_at)
        .bind(serde_json::to_value(progress)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_progress(&self, task_id: Uuid) -> Result<Option<GenerationProgress>> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT doc FROM generation_progress WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(doc,)| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }

    async fn active_progress(&self) -> Result<Vec<GenerationProgress>> {
        let rows = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT doc FROM generation_progress WHERE status = $1 ORDER BY started_at",
        )
        .bind(GenerationStatus::InProgress.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(doc,)| serde_json::from_value(doc).map_err(Into::into))
            .collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM generation_progress WHERE status <> $1 AND updated_at < $2",
        )
        .bind(GenerationStatus::InProgress.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// NewsletterStore
// ---------------------------------------------------------------------------

const NEWSLETTER_COLUMNS: &str = "id, kind, period_key, title, body, citations, quality_metrics, \
     degradations, task_id, created_at";

#[async_trait]
impl NewsletterStore for PgStore {
    async fn save_newsletter(&self, newsletter: &Newsletter) -> Result<()> {
        sqlx::query(
            "INSERT INTO newsletters
                (id, kind, period_key, title, body, citations, quality_metrics,
                 degradations, task_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(newsletter.id)
        .bind(newsletter.kind.as_str())
        .bind(&newsletter.period_key)
        .bind(&newsletter.title)
        .bind(&newsletter.body)
        .bind(serde_json::to_value(&newsletter.citations)?)
        .bind(serde_json::to_value(&newsletter.quality_metrics)?)
        .bind(&newsletter.degradations)
        .bind(newsletter.task_id)
        .bind(newsletter.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_newsletter(
        &self,
        kind: NewsletterKind,
        period_key: &str,
    ) -> Result<Option<Newsletter>> {
        let row = sqlx::query_as::<_, NewsletterRow>(&format!(
            "SELECT {NEWSLETTER_COLUMNS} FROM newsletters
             WHERE kind = $1 AND period_key = $2
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(kind.as_str())
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Newsletter::try_from).transpose()
    }

    async fn get_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>> {
        let row = sqlx::query_as::<_, NewsletterRow>(&format!(
            "SELECT {NEWSLETTER_COLUMNS} FROM newsletters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Newsletter::try_from).transpose()
    }
}

// ---------------------------------------------------------------------------
// AlertStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert_if_new(&self, alert: &Alert) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO alerts
                (id, alert_type, severity, generated_at, window_start, window_end,
                 window_key, observed, threshold, context)
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
             WHERE NOT EXISTS (
                SELECT 1 FROM alerts
                WHERE alert_type = $2
                  AND window_key = $7
                  AND (CASE severity WHEN 'critical' THEN 1 ELSE 0 END) >= $11
             )
             ON CONFLICT (alert_type, window_key, severity) DO NOTHING",
        )
        .bind(alert.id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.generated_at)
        .bind(alert.window_start)
        .bind(alert.window_end)
        .bind(alert.window_key)
        .bind(alert.observed)
        .bind(alert.threshold)
        .bind(&alert.context)
        .bind(severity_rank(alert.severity))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT id, alert_type, severity, generated_at, window_start, window_end,
                    window_key, observed, threshold, context
             FROM alerts
             ORDER BY generated_at DESC
             LIMIT $1",
        )
        .bind(limit.min(1000) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// MetricsStore
// ---------------------------------------------------------------------------

#[async_trait]
impl MetricsStore for PgStore {
    async fn window_metrics(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowMetrics> {
        let (newsletters, avg_quality_score, avg_citation_count) =
            sqlx::query_as::<_, (i64, Option<f64>, Option<f64>)>(
                "SELECT COUNT(*),
                        AVG((quality_metrics->>'confidence')::float8),
                        AVG((quality_metrics->>'citation_count')::float8)
                 FROM newsletters
                 WHERE created_at >= $1 AND created_at < $2",
            )
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await?;

        let (runs_finished, runs_failed) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'failed')
             FROM generation_progress
             WHERE status <> 'in_progress' AND updated_at >= $1 AND updated_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        let (records_finished, records_failed, spend) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COALESCE(SUM(cost_micros) FILTER (WHERE status = 'succeeded'), 0)::BIGINT
             FROM batch_records
             WHERE status IN ('succeeded', 'failed') AND updated_at >= $1 AND updated_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowMetrics {
            newsletters: newsletters as u32,
            avg_quality_score,
            avg_citation_count,
            runs_finished: runs_finished as u32,
            runs_failed: runs_failed as u32,
            records_finished: records_finished as u32,
            records_failed: records_failed as u32,
            total_spend: usd(spend),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalpress_common::RecordStatus;

    #[test]
    fn negative_micros_clamp_to_zero() {
        assert_eq!(usd(-5), Usd::ZERO);
        assert_eq!(usd(1300), Usd::from_dollars(0.0013));
    }

    #[test]
    fn unknown_status_string_is_an_error() {
        assert!(parse::<RecordStatus>("exploded").is_err());
        assert_eq!(
            parse::<RecordStatus>("in_progress").unwrap(),
            RecordStatus::InProgress
        );
    }

    #[test]
    fn critical_outranks_warning() {
        assert!(severity_rank(AlertSeverity::Critical) > severity_rank(AlertSeverity::Warning));
    }
}
