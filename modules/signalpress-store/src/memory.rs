//! In-memory store. One lock guards all state, so every conditional
//! transition is atomic with respect to every other writer.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use signalpress_common::{
    mean, Alert, AnalysisRecord, AnalyzedItem, Article, BatchRecord, BatchSession,
    GenerationProgress, GenerationStatus, ItemId, Newsletter, NewsletterKind, RecordStatus,
    SessionStatus, SessionSummary, SignalRow, Usd, WindowMetrics,
};

use crate::traits::{
    AlertStore, AnalysisStore, ArticleStore, MetricsStore, NewsletterStore, ProgressStore,
    SessionStore,
};

#[derive(Default)]
struct Inner {
    articles: BTreeMap<ItemId, Article>,
    sessions: HashMap<Uuid, BatchSession>,
    records: HashMap<Uuid, BatchRecord>,
    /// Record ids per session, in item order.
    session_records: HashMap<Uuid, Vec<Uuid>>,
    analyses: HashMap<ItemId, AnalysisRecord>,
    signals: HashMap<ItemId, Vec<SignalRow>>,
    progress: HashMap<Uuid, GenerationProgress>,
    newsletters: Vec<Newsletter>,
    alerts: Vec<Alert>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed articles in one call. Convenience for fixtures and local runs.
    pub async fn with_articles(self, articles: impl IntoIterator<Item = Article>) -> Self {
        {
            let mut inner = self.inner.write().await;
            for article in articles {
                inner.articles.insert(article.id, article);
            }
        }
        self
    }
}

fn touch(inner: &mut Inner, session_id: Uuid, now: DateTime<Utc>) {
    if let Some(session) = inner.sessions.get_mut(&session_id) {
        if now > session.updated_at {
            session.updated_at = now;
        }
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn list_articles(&self) -> Result<Vec<Article>> {
        Ok(self.inner.read().await.articles.values().cloned().collect())
    }

    async fn get_article(&self, id: ItemId) -> Result<Option<Article>> {
        Ok(self.inner.read().await.articles.get(&id).cloned())
    }

    async fn upsert_article(&self, article: &Article) -> Result<()> {
        self.inner
            .write()
            .await
            .articles
            .insert(article.id, article.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &BatchSession, records: &[BatchRecord]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            bail!("session {} already exists", session.id);
        }
        inner.sessions.insert(session.id, session.clone());
        let ids = records.iter().map(|r| r.id).collect();
        for record in records {
            inner.records.insert(record.id, record.clone());
        }
        inner.session_records.insert(session.id, ids);
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<BatchSession>> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn live_sessions(&self) -> Result<Vec<BatchSession>> {
        let inner = self.inner.read().await;
        let mut live: Vec<BatchSession> = inner
            .sessions
            .values()
            .filter(|s| s.is_live())
            .cloned()
            .collect();
        live.sort_by_key(|s| s.created_at);
        Ok(live)
    }

    async fn transition_session(
        &self,
        id: Uuid,
        next: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&id) {
            Some(session) => Ok(session.transition(next, now)),
            None => Ok(false),
        }
    }

    async fn mark_truncated(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.truncated = true;
        }
        touch(&mut inner, id, now);
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        touch(&mut *self.inner.write().await, id, now);
        Ok(())
    }

    async fn add_session_spend(&self, id: Uuid, amount: Usd, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.budget_spent += amount;
        }
        touch(&mut inner, id, now);
        Ok(())
    }

    async fn finalize_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        summary: &SessionSummary,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if !session.is_live() {
            return Ok(false);
        }
        session.transition(status, now);
        session.summary = Some(summary.clone());
        session.finalized_at = Some(now);
        session.updated_at = now;
        Ok(true)
    }

    async fn records_for_session(&self, session_id: Uuid) -> Result<Vec<BatchRecord>> {
        let inner = self.inner.read().await;
        let ids = inner
            .session_records
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<BatchRecord>> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn claim_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != RecordStatus::Pending {
            return Ok(false);
        }
        record.status = RecordStatus::InProgress;
        record.last_attempted_at = Some(now);
        record.updated_at = now;
        let session_id = record.session_id;
        touch(&mut inner, session_id, now);
        Ok(true)
    }

    async fn release_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(&id) {
            if record.status == RecordStatus::InProgress {
                record.status = RecordStatus::Pending;
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn fail_record(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != RecordStatus::InProgress {
            return Ok(false);
        }
        record.status = RecordStatus::Failed;
        record.attempt_count += 1;
        record.last_error = Some(error.to_string());
        record.last_attempted_at = Some(now);
        record.updated_at = now;
        let session_id = record.session_id;
        touch(&mut inner, session_id, now);
        Ok(true)
    }

    async fn abandon_records(&self, ids: &[Uuid], reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(record) = inner.records.get_mut(id) {
                if matches!(record.status, RecordStatus::Pending | RecordStatus::Failed) {
                    record.status = RecordStatus::Abandoned;
                    record.last_error = Some(reason.to_string());
                    record.updated_at = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn reset_failed_record(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != RecordStatus::Failed {
            return Ok(false);
        }
        record.status = RecordStatus::Pending;
        record.updated_at = now;
        let session_id = record.session_id;
        touch(&mut inner, session_id, now);
        Ok(true)
    }

    async fn processed_item_ids(&self) -> Result<HashSet<ItemId>> {
        let inner = self.inner.read().await;
        let mut ids: HashSet<ItemId> = inner.analyses.keys().copied().collect();
        ids.extend(
            inner
                .records
                .values()
                .filter(|r| r.status == RecordStatus::Succeeded)
                .map(|r| r.item_id),
        );
        Ok(ids)
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn record_analysis(
        &self,
        analysis: &AnalysisRecord,
        signals: &[SignalRow],
        charged: Usd,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(&analysis.record_id) else {
            return Ok(false);
        };
        if record.status != RecordStatus::InProgress {
            return Ok(false);
        }
        record.status = RecordStatus::Succeeded;
        record.attempt_count += 1;
        record.cost = analysis.cost;
        record.last_error = None;
        record.updated_at = now;

        inner.analyses.insert(analysis.item_id, analysis.clone());
        inner.signals.insert(analysis.item_id, signals.to_vec());
        if let Some(session) = inner.sessions.get_mut(&analysis.session_id) {
            session.budget_spent += charged;
        }
        touch(&mut inner, analysis.session_id, now);
        Ok(true)
    }

    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AnalysisRecord>> {
        Ok(self.inner.read().await.analyses.get(&item_id).cloned())
    }

    async fn signals_for_item(&self, item_id: ItemId) -> Result<Vec<SignalRow>> {
        Ok(self
            .inner
            .read()
            .await
            .signals
            .get(&item_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn analyzed_items_since(&self, since: DateTime<Utc>) -> Result<Vec<AnalyzedItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<AnalyzedItem> = inner
            .analyses
            .values()
            .filter(|a| a.analyzed_at >= since)
            .filter_map(|a| {
                let article = inner.articles.get(&a.item_id)?;
                Some(AnalyzedItem {
                    item_id: a.item_id,
                    title: article.title.clone(),
                    url: article.url.clone(),
                    summary: a.summary.clone(),
                    signal_strength: a.signal_strength,
                    confidence: a.confidence,
                    themes: a.themes.clone(),
                    analyzed_at: a.analyzed_at,
                })
            })
            .collect();
        items.sort_by_key(|i| i.item_id);
        Ok(items)
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn save_progress(&self, progress: &GenerationProgress) -> Result<()> {
        self.inner
            .write()
            .await
            .progress
            .insert(progress.task_id, progress.clone());
        Ok(())
    }

    async fn load_progress(&self, task_id: Uuid) -> Result<Option<GenerationProgress>> {
        Ok(self.inner.read().await.progress.get(&task_id).cloned())
    }

    async fn active_progress(&self) -> Result<Vec<GenerationProgress>> {
        let inner = self.inner.read().await;
        let mut active: Vec<GenerationProgress> = inner
            .progress
            .values()
            .filter(|p| !p.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|p| p.started_at);
        Ok(active)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.progress.len();
        inner
            .progress
            .retain(|_, p| !(p.is_terminal() && p.updated_at < cutoff));
        Ok((before - inner.progress.len()) as u64)
    }
}

#[async_trait]
impl NewsletterStore for MemoryStore {
    async fn save_newsletter(&self, newsletter: &Newsletter) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.newsletters.retain(|n| n.id != newsletter.id);
        inner.newsletters.push(newsletter.clone());
        Ok(())
    }

    async fn find_newsletter(
        &self,
        kind: NewsletterKind,
        period_key: &str,
    ) -> Result<Option<Newsletter>> {
        let inner = self.inner.read().await;
        Ok(inner
            .newsletters
            .iter()
            .filter(|n| n.kind == kind && n.period_key == period_key)
            .max_by_key(|n| n.created_at)
            .cloned())
    }

    async fn get_newsletter(&self, id: Uuid) -> Result<Option<Newsletter>> {
        let inner = self.inner.read().await;
        Ok(inner.newsletters.iter().find(|n| n.id == id).cloned())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert_if_new(&self, alert: &Alert) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let covered = inner.alerts.iter().any(|a| {
            a.alert_type == alert.alert_type
                && a.window_key == alert.window_key
                && a.severity >= alert.severity
        });
        if covered {
            return Ok(false);
        }
        inner.alerts.push(alert.clone());
        Ok(true)
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let inner = self.inner.read().await;
        let mut alerts = inner.alerts.clone();
        alerts.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        alerts.truncate(limit);
        Ok(alerts)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn window_metrics(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowMetrics> {
        let inner = self.inner.read().await;
        let in_window = |ts: DateTime<Utc>| ts >= from && ts < to;

        let newsletters: Vec<&Newsletter> = inner
            .newsletters
            .iter()
            .filter(|n| in_window(n.created_at))
            .collect();

        let finished_runs: Vec<&GenerationProgress> = inner
            .progress
            .values()
            .filter(|p| p.is_terminal() && in_window(p.updated_at))
            .collect();

        let finished_records: Vec<&BatchRecord> = inner
            .records
            .values()
            .filter(|r| {
                matches!(r.status, RecordStatus::Succeeded | RecordStatus::Failed)
                    && in_window(r.updated_at)
            })
            .collect();

        Ok(WindowMetrics {
            newsletters: newsletters.len() as u32,
            avg_quality_score: mean(newsletters.iter().map(|n| n.quality_metrics.confidence)),
            avg_citation_count: mean(
                newsletters
                    .iter()
                    .map(|n| n.quality_metrics.citation_count as f64),
            ),
            runs_finished: finished_runs.len() as u32,
            runs_failed: finished_runs
                .iter()
                .filter(|p| p.status == GenerationStatus::Failed)
                .count() as u32,
            records_finished: finished_records.len() as u32,
            records_failed: finished_records
                .iter()
                .filter(|r| r.status == RecordStatus::Failed)
                .count() as u32,
            total_spend: finished_records
                .iter()
                .filter(|r| r.status == RecordStatus::Succeeded)
                .map(|r| r.cost)
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(records: usize) -> (BatchSession, Vec<BatchRecord>) {
        let now = Utc::now();
        let session = BatchSession::new(
            Usd::from_dollars(1.0),
            10,
            (1..=records as i64).collect(),
            now,
        );
        let recs = session
            .item_ids
            .iter()
            .map(|id| BatchRecord::new(session.id, *id, now))
            .collect();
        (session, recs)
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let (session, records) = session_with(1);
        store.create_session(&session, &records).await.unwrap();
        let id = records[0].id;

        assert!(store.claim_record(id, Utc::now()).await.unwrap());
        assert!(!store.claim_record(id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn fail_increments_attempts_and_reset_requires_failed() {
        let store = MemoryStore::new();
        let (session, records) = session_with(1);
        store.create_session(&session, &records).await.unwrap();
        let id = records[0].id;

        assert!(!store.reset_failed_record(id, Utc::now()).await.unwrap());
        store.claim_record(id, Utc::now()).await.unwrap();
        assert!(store.fail_record(id, "timeout", Utc::now()).await.unwrap());

        let failed = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(failed.status, RecordStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));

        assert!(store.reset_failed_record(id, Utc::now()).await.unwrap());
        let reset = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(reset.status, RecordStatus::Pending);
        assert_eq!(reset.attempt_count, 1);
    }

    #[tokio::test]
    async fn finalize_happens_once() {
        let store = MemoryStore::new();
        let (session, records) = session_with(0);
        store.create_session(&session, &records).await.unwrap();
        let summary = SessionSummary {
            total_items: 0,
            succeeded: 0,
            failed: 0,
            abandoned: 0,
            total_spent: Usd::ZERO,
            budget_utilization_pct: 0.0,
        };
        let now = Utc::now();
        assert!(store
            .finalize_session(session.id, SessionStatus::Completed, &summary, now)
            .await
            .unwrap());
        assert!(!store
            .finalize_session(session.id, SessionStatus::Failed, &summary, now)
            .await
            .unwrap());
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert!(store.live_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_analysis_requires_in_progress() {
        let store = MemoryStore::new();
        let (session, records) = session_with(1);
        store.create_session(&session, &records).await.unwrap();
        let record = &records[0];
        let analysis = AnalysisRecord {
            item_id: record.item_id,
            record_id: record.id,
            session_id: session.id,
            summary: "s".into(),
            signal_strength: 0.5,
            confidence: 0.5,
            themes: vec![],
            cost: Usd::from_dollars(0.0013),
            analyzed_at: Utc::now(),
        };

        let charged = Usd::from_dollars(0.0013);
        assert!(!store.record_analysis(&analysis, &[], charged, Utc::now()).await.unwrap());
        assert!(store.get_analysis(record.item_id).await.unwrap().is_none());

        store.claim_record(record.id, Utc::now()).await.unwrap();
        assert!(store.record_analysis(&analysis, &[], charged, Utc::now()).await.unwrap());
        let done = store.get_record(record.id).await.unwrap().unwrap();
        assert_eq!(done.status, RecordStatus::Succeeded);
        assert_eq!(done.cost, Usd::from_dollars(0.0013));
        // Spend is booked with the analysis, and only once.
        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.budget_spent, charged);
        assert!(store
            .processed_item_ids()
            .await
            .unwrap()
            .contains(&record.item_id));
    }
}
