use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use signalpress_common::{
    BatchRecord, BatchSession, RecordCounts, RecordStatus, SessionStatus, SessionSummary, Usd,
};

use crate::batch::eligibility;
use crate::deps::PipelineDeps;
use crate::queue::{BatchTask, Task};

pub const BUDGET_EXHAUSTED: &str = "budget exhausted";

/// Request to start a batch analysis session.
#[derive(Debug, Clone)]
pub struct InitiateBatch {
    pub budget_cap: Usd,
    pub batch_size: Option<u32>,
    pub max_items: Option<usize>,
}

#[derive(Debug, Error)]
pub enum InitiateError {
    #[error("budget cap must be greater than zero")]
    InvalidBudget,
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A session together with its live record counts.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: BatchSession,
    pub budget_utilization_pct: f64,
    pub counts: RecordCounts,
}

/// How the planner split a session's records.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct BatchPlan {
    pub scheduled: Vec<Vec<Uuid>>,
    pub unscheduled: Vec<Uuid>,
}

/// Partition records into batches and admit as many items as the remaining
/// budget covers at the estimated cost. Everything after the first shortfall
/// is unscheduled.
pub(crate) fn plan_batches(
    records: &[BatchRecord],
    batch_size: usize,
    remaining: Usd,
    estimated_item_cost: Usd,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut planned = Usd::ZERO;

    let mut chunks = records.chunks(batch_size.max(1));
    for chunk in chunks.by_ref() {
        let affordable = remaining
            .saturating_sub(planned)
            .units_of(estimated_item_cost)
            .min(chunk.len() as u64) as usize;

        if affordable > 0 {
            plan.scheduled
                .push(chunk[..affordable].iter().map(|r| r.id).collect());
            planned += estimated_item_cost.times(affordable as u64);
        }
        if affordable < chunk.len() {
            plan.unscheduled
                .extend(chunk[affordable..].iter().map(|r| r.id));
            break;
        }
    }
    for chunk in chunks {
        plan.unscheduled.extend(chunk.iter().map(|r| r.id));
    }
    plan
}

/// Creates sessions, schedules their batches, and finalizes them.
#[derive(Clone)]
pub struct BatchOrchestrator {
    deps: PipelineDeps,
}

impl BatchOrchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub async fn initiate(&self, request: InitiateBatch) -> Result<BatchSession, InitiateError> {
        if request.budget_cap.is_zero() {
            return Err(InitiateError::InvalidBudget);
        }
        let config = &self.deps.config.batch;
        let batch_size = request.batch_size.unwrap_or(config.default_batch_size);
        if batch_size == 0 {
            return Err(InitiateError::InvalidBatchSize);
        }

        let store = &self.deps.store;
        let now = Utc::now();
        let item_ids =
            eligibility::candidates(store.as_ref(), config.min_content_chars, request.max_items)
                .await?;

        let session = BatchSession::new(request.budget_cap, batch_size, item_ids, now);
        let records: Vec<BatchRecord> = session
            .item_ids
            .iter()
            .map(|item_id| BatchRecord::new(session.id, *item_id, now))
            .collect();
        store.create_session(&session, &records).await?;

        info!(
            session_id = %session.id,
            items = records.len(),
            budget_cap = %session.budget_cap,
            batch_size,
            "Batch session created"
        );

        if records.is_empty() {
            self.finalize(session.id).await?;
            return self.reload(session.id).await;
        }

        let ledger = self.deps.ledgers.ledger_for(&session).await;
        let plan = plan_batches(
            &records,
            batch_size as usize,
            ledger.remaining(),
            config.estimated_item_cost(),
        );

        store
            .transition_session(session.id, SessionStatus::Running, now)
            .await?;

        if !plan.unscheduled.is_empty() {
            store
                .abandon_records(&plan.unscheduled, BUDGET_EXHAUSTED, now)
                .await?;
            store.mark_truncated(session.id, now).await?;
            store
                .transition_session(session.id, SessionStatus::PartiallyComplete, now)
                .await?;
            warn!(
                session_id = %session.id,
                scheduled = records.len() - plan.unscheduled.len(),
                truncated = plan.unscheduled.len(),
                "Budget cannot cover every item, session truncated"
            );
        }

        if plan.scheduled.is_empty() {
            self.finalize(session.id).await?;
            return self.reload(session.id).await;
        }

        let delay = config.inter_batch_delay();
        for (index, record_ids) in plan.scheduled.into_iter().enumerate() {
            let task = Task::AnalyzeBatch(BatchTask {
                session_id: session.id,
                record_ids,
                batch_index: index,
                retry: false,
            });
            self.deps
                .queue
                .enqueue(task, delay * index as u32)
                .await?;
        }

        self.reload(session.id).await
    }

    async fn reload(&self, session_id: Uuid) -> Result<BatchSession, InitiateError> {
        self.deps
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} vanished after creation").into())
    }

    /// Finalize a session if it is ready. Ready means every record is settled,
    /// or the budget cannot cover another item and nothing is in flight (the
    /// leftover PENDING and FAILED records are abandoned first).
    ///
    /// Returns the summary when this call finalized the session; `None` if it
    /// was not ready or was already finalized.
    pub async fn finalize(&self, session_id: Uuid) -> Result<Option<SessionSummary>> {
        self.finalize_at(session_id, Utc::now()).await
    }

    pub async fn finalize_at(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionSummary>> {
        let store = &self.deps.store;
        let Some(session) = store.get_session(session_id).await? else {
            return Ok(None);
        };
        if !session.is_live() {
            return Ok(None);
        }

        let max_retries = self.deps.config.recovery.max_retries;
        let mut records = store.records_for_session(session_id).await?;

        if !records.iter().all(|r| r.is_settled(max_retries)) {
            let budget_exhausted = session
                .budget_cap
                .saturating_sub(session.budget_spent)
                < self.deps.config.batch.estimated_item_cost();
            let in_flight = records
                .iter()
                .any(|r| r.status == RecordStatus::InProgress);
            if !budget_exhausted || in_flight {
                return Ok(None);
            }

            let leftovers: Vec<Uuid> = records
                .iter()
                .filter(|r| matches!(r.status, RecordStatus::Pending | RecordStatus::Failed))
                .map(|r| r.id)
                .collect();
            store
                .abandon_records(&leftovers, BUDGET_EXHAUSTED, now)
                .await?;
            store.mark_truncated(session_id, now).await?;
            records = store.records_for_session(session_id).await?;
        }

        let counts = RecordCounts::tally(&records);
        let truncated = session.truncated || counts.abandoned > 0;
        let status = if truncated {
            SessionStatus::PartiallyComplete
        } else if counts.succeeded == counts.total() {
            SessionStatus::Completed
        } else if counts.succeeded == 0 {
            SessionStatus::Failed
        } else {
            SessionStatus::PartiallyComplete
        };

        let summary = SessionSummary {
            total_items: counts.total(),
            succeeded: counts.succeeded,
            failed: counts.failed,
            abandoned: counts.abandoned,
            total_spent: session.budget_spent,
            budget_utilization_pct: session.utilization_pct(),
        };

        if !store
            .finalize_session(session_id, status, &summary, now)
            .await?
        {
            return Ok(None);
        }
        self.deps.ledgers.remove(session_id).await;

        info!(
            %session_id,
            status = %status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            abandoned = summary.abandoned,
            spent = %summary.total_spent,
            utilization_pct = summary.budget_utilization_pct,
            "Batch session finalized"
        );
        Ok(Some(summary))
    }

    /// The session plus live record counts.
    pub async fn summary(&self, session_id: Uuid) -> Result<Option<SessionView>> {
        let store = &self.deps.store;
        let Some(session) = store.get_session(session_id).await? else {
            return Ok(None);
        };
        let records = store.records_for_session(session_id).await?;
        Ok(Some(SessionView {
            budget_utilization_pct: session.utilization_pct(),
            counts: RecordCounts::tally(&records),
            session,
        }))
    }
}
