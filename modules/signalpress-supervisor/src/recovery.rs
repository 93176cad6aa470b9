//! Recovery sweep.
//!
//! Periodically reconciles live batch sessions and generation runs with what
//! the workers left behind: failed records are retried with exponential
//! backoff, abandoned attempts and silent sessions are marked stalled, settled
//! sessions are finalized, and old progress rows are purged.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use signalpress_common::{
    Alert, AlertSeverity, AlertType, BatchRecord, BatchSession, RecordStatus, SessionStatus,
};
use signalpress_pipeline::batch::BatchOrchestrator;
use signalpress_pipeline::generation::UpdateOutcome;
use signalpress_pipeline::{BatchTask, PipelineDeps, Task};

use crate::alerts::publish;
use crate::notify::AlertNotifier;
use crate::types::RecoveryStats;

pub const ATTEMPT_STALLED: &str = "attempt stalled";

pub struct RecoverySweeper {
    deps: PipelineDeps,
    orchestrator: BatchOrchestrator,
    notifier: Arc<dyn AlertNotifier>,
    running: Mutex<()>,
}

impl RecoverySweeper {
    pub fn new(deps: PipelineDeps, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self {
            orchestrator: BatchOrchestrator::new(deps.clone()),
            deps,
            notifier,
            running: Mutex::new(()),
        }
    }

    /// Run one sweep as of `now`. A sweep already in progress makes this a no-op.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RecoveryStats> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Recovery sweep already running, skipping");
            return Ok(RecoveryStats::default());
        };

        let mut stats = RecoveryStats::default();

        for session in self.deps.store.live_sessions().await? {
            stats.sessions_checked += 1;
            if let Err(e) = self.recover_session(&session, now, &mut stats).await {
                warn!(session_id = %session.id, error = %e, "Failed to recover session");
            }
        }

        self.recover_runs(now, &mut stats).await?;

        let cutoff = now - self.deps.config.generation.progress_retention();
        stats.progress_purged = self.deps.progress.purge_terminal_before(cutoff).await?;

        if !stats.is_quiet() {
            info!("Recovery sweep complete. {stats}");
        }
        Ok(stats)
    }

    async fn recover_session(
        &self,
        session: &BatchSession,
        now: DateTime<Utc>,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let store = &self.deps.store;
        let recovery = &self.deps.config.recovery;
        let stall_timeout = recovery.stall_timeout();

        if session.status == SessionStatus::Running && now - session.updated_at > stall_timeout {
            if store
                .transition_session(session.id, SessionStatus::Stalled, now)
                .await?
            {
                stats.sessions_stalled += 1;
                warn!(
                    session_id = %session.id,
                    idle_secs = (now - session.updated_at).num_seconds(),
                    "Batch session stalled"
                );
                let alert = Alert::new(
                    AlertType::StuckGeneration,
                    AlertSeverity::Critical,
                    session.updated_at,
                    now,
                    session.updated_at,
                    (now - session.updated_at).num_seconds() as f64,
                    stall_timeout.num_seconds() as f64,
                    json!({ "session_id": session.id }),
                );
                publish(store.as_ref(), self.notifier.as_ref(), &alert).await?;
            }
        }

        let records = store.records_for_session(session.id).await?;

        for record in records.iter().filter(|r| attempt_is_stale(r, now, stall_timeout)) {
            if store.fail_record(record.id, ATTEMPT_STALLED, now).await? {
                stats.attempts_failed += 1;
                warn!(record_id = %record.id, item_id = record.item_id, "Abandoned attempt failed");
            }
        }

        let due = due_for_retry(&records, recovery.max_retries, recovery.base_delay(), now);
        let mut reset = Vec::with_capacity(due.len());
        for record_id in due {
            if store.reset_failed_record(record_id, now).await? {
                reset.push(record_id);
            }
        }
        if !reset.is_empty() {
            stats.records_reset += reset.len() as u32;
            info!(session_id = %session.id, records = reset.len(), "Retrying failed records");
            self.deps
                .queue
                .enqueue(
                    Task::AnalyzeBatch(BatchTask {
                        session_id: session.id,
                        record_ids: reset,
                        batch_index: 0,
                        retry: true,
                    }),
                    Duration::ZERO,
                )
                .await?;
        }

        if self.orchestrator.finalize_at(session.id, now).await?.is_some() {
            stats.sessions_finalized += 1;
        }
        Ok(())
    }

    async fn recover_runs(&self, now: DateTime<Utc>, stats: &mut RecoveryStats) -> Result<()> {
        let stall_timeout = self.deps.config.recovery.stall_timeout();
        let tracker = &self.deps.progress;

        for run in tracker.active().await? {
            let idle = now - run.updated_at;
            if idle <= stall_timeout {
                continue;
            }
            let reason = format!("stalled: no progress for {}s", idle.num_seconds());
            if let UpdateOutcome::Applied(_) = tracker.fail(run.task_id, &reason).await? {
                stats.runs_failed += 1;
                let alert = Alert::new(
                    AlertType::StuckGeneration,
                    AlertSeverity::Critical,
                    run.updated_at,
                    now,
                    run.updated_at,
                    idle.num_seconds() as f64,
                    stall_timeout.num_seconds() as f64,
                    json!({ "task_id": run.task_id, "step": run.current_step }),
                );
                publish(self.deps.store.as_ref(), self.notifier.as_ref(), &alert).await?;
            }
        }
        Ok(())
    }
}

fn attempt_is_stale(record: &BatchRecord, now: DateTime<Utc>, stall_timeout: chrono::Duration) -> bool {
    record.status == RecordStatus::InProgress
        && record
            .last_attempted_at
            .is_some_and(|at| now - at > stall_timeout)
}

/// FAILED records with retries left whose backoff has elapsed.
fn due_for_retry(
    records: &[BatchRecord],
    max_retries: u32,
    base_delay: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    records
        .iter()
        .filter(|r| r.status == RecordStatus::Failed && r.retries_remaining(max_retries))
        .filter(|r| r.retry_due_at(base_delay).is_some_and(|due| due <= now))
        .map(|r| r.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn failed(attempts: u32, last: DateTime<Utc>) -> BatchRecord {
        let mut r = BatchRecord::new(Uuid::new_v4(), 1, last);
        r.status = RecordStatus::Failed;
        r.attempt_count = attempts;
        r.last_attempted_at = Some(last);
        r
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let now = Utc::now();
        let base = ChronoDuration::seconds(60);
        // 1 attempt: due 120s after the last one.
        assert_eq!(due_for_retry(&[failed(1, now - ChronoDuration::seconds(119))], 3, base, now).len(), 0);
        assert_eq!(due_for_retry(&[failed(1, now - ChronoDuration::seconds(120))], 3, base, now).len(), 1);
        // 2 attempts: 240s.
        assert_eq!(due_for_retry(&[failed(2, now - ChronoDuration::seconds(200))], 3, base, now).len(), 0);
    }

    #[test]
    fn exhausted_records_are_not_retried() {
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(1);
        assert!(due_for_retry(&[failed(3, long_ago)], 3, ChronoDuration::seconds(60), now).is_empty());
    }
}
