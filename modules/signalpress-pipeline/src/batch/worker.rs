use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use signalpress_common::{AnalysisRecord, SessionStatus};

use crate::batch::budget::BudgetLedger;
use crate::batch::orchestrator::{BatchOrchestrator, BUDGET_EXHAUSTED};
use crate::deps::PipelineDeps;
use crate::queue::BatchTask;

/// Counts for one executed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: u32,
    pub failed: u32,
    /// Records another worker had already claimed or settled.
    pub skipped: u32,
    pub abandoned: u32,
    pub budget_exhausted: bool,
}

impl std::fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "succeeded={} failed={} skipped={} abandoned={}",
            self.succeeded, self.failed, self.skipped, self.abandoned
        )?;
        if self.budget_exhausted {
            write!(f, " (budget exhausted)")?;
        }
        Ok(())
    }
}

enum ItemOutcome {
    Succeeded,
    Failed,
    Skipped,
    /// Not attempted because the budget ran out. The record is still PENDING.
    Unaffordable(Uuid),
}

/// Executes one `BatchTask`: claim, reserve, analyze, persist, per record.
#[derive(Clone)]
pub struct BatchWorker {
    deps: PipelineDeps,
    orchestrator: BatchOrchestrator,
}

impl BatchWorker {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            orchestrator: BatchOrchestrator::new(deps.clone()),
            deps,
        }
    }

    pub async fn run(&self, task: &BatchTask) -> Result<BatchOutcome> {
        let Some(session) = self.deps.store.get_session(task.session_id).await? else {
            warn!(session_id = %task.session_id, "Batch task for unknown session, dropping");
            return Ok(BatchOutcome::default());
        };
        if !session.is_live() {
            debug!(session_id = %session.id, "Session already finalized, skipping batch");
            return Ok(BatchOutcome::default());
        }

        let ledger = self.deps.ledgers.ledger_for(&session).await;
        let halted = AtomicBool::new(false);
        let concurrency = self.deps.config.batch.worker_concurrency.max(1);

        let results: Vec<(Uuid, Result<ItemOutcome>)> = stream::iter(task.record_ids.iter().copied())
            .map(|record_id| {
                let ledger = ledger.clone();
                let halted = &halted;
                async move { (record_id, self.process(record_id, &ledger, halted).await) }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        let mut unaffordable = Vec::new();
        for (record_id, result) in results {
            match result {
                Ok(ItemOutcome::Succeeded) => outcome.succeeded += 1,
                Ok(ItemOutcome::Failed) => outcome.failed += 1,
                Ok(ItemOutcome::Skipped) => outcome.skipped += 1,
                Ok(ItemOutcome::Unaffordable(id)) => unaffordable.push(id),
                Err(e) => {
                    warn!(%record_id, error = %e, "Record processing errored");
                    outcome.failed += 1;
                }
            }
        }

        if !unaffordable.is_empty() {
            let now = Utc::now();
            let store = &self.deps.store;
            outcome.abandoned = store
                .abandon_records(&unaffordable, BUDGET_EXHAUSTED, now)
                .await? as u32;
            outcome.budget_exhausted = true;
            store.mark_truncated(session.id, now).await?;
            store
                .transition_session(session.id, SessionStatus::PartiallyComplete, now)
                .await?;
        }

        ledger.log_status(session.id);
        info!(
            session_id = %session.id,
            batch = task.batch_index,
            retry = task.retry,
            %outcome,
            "Batch complete"
        );

        self.orchestrator.finalize(session.id).await?;
        Ok(outcome)
    }

    async fn process(
        &self,
        record_id: Uuid,
        ledger: &Arc<BudgetLedger>,
        halted: &AtomicBool,
    ) -> Result<ItemOutcome> {
        if halted.load(Ordering::Acquire) {
            return Ok(ItemOutcome::Unaffordable(record_id));
        }

        let store = &self.deps.store;
        if !store.claim_record(record_id, Utc::now()).await? {
            debug!(%record_id, "Record not claimable, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        let Some(record) = store.get_record(record_id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        let Some(article) = store.get_article(record.item_id).await? else {
            store
                .fail_record(record_id, "article not found", Utc::now())
                .await?;
            return Ok(ItemOutcome::Failed);
        };

        let reservation = match ledger.reserve(self.deps.config.batch.estimated_item_cost()) {
            Ok(reservation) => reservation,
            Err(exceeded) => {
                halted.store(true, Ordering::Release);
                store.release_claim(record_id, Utc::now()).await?;
                info!(%record_id, %exceeded, "Budget exhausted, halting batch");
                return Ok(ItemOutcome::Unaffordable(record_id));
            }
        };

        let timeout = self.deps.config.batch.item_timeout();
        let error = match tokio::time::timeout(timeout, self.deps.analyzer.analyze(&article)).await
        {
            Ok(Ok(analysis)) => {
                let charged = ledger.commit(reservation, analysis.cost);
                let now = Utc::now();
                let (row, signals) =
                    AnalysisRecord::from_output(&record, &analysis.output, analysis.cost, now);

                match store.record_analysis(&row, &signals, charged, now).await {
                    Ok(true) => {
                        debug!(%record_id, item_id = record.item_id, cost = %analysis.cost, "Item analyzed");
                        return Ok(ItemOutcome::Succeeded);
                    }
                    // The service already billed for this call.
                    Ok(false) => {
                        store.add_session_spend(record.session_id, charged, now).await?;
                        warn!(%record_id, "Record moved on before the analysis was stored");
                        return Ok(ItemOutcome::Skipped);
                    }
                    Err(e) => {
                        store.add_session_spend(record.session_id, charged, now).await?;
                        format!("failed to store analysis: {e:#}")
                    }
                }
            }
            Ok(Err(e)) => {
                ledger.release(reservation);
                format!("{e:#}")
            }
            Err(_) => {
                ledger.release(reservation);
                format!("analysis timed out after {}s", timeout.as_secs())
            }
        };

        warn!(%record_id, item_id = record.item_id, error = %error, "Item analysis failed");
        store.fail_record(record_id, &error, Utc::now()).await?;
        Ok(ItemOutcome::Failed)
    }
}
