//! Progress tracker for generation runs.
//!
//! A forward-only state machine per run: SELECTION → SYNTHESIS → WRITING →
//! STORAGE → COMPLETE | FAILED. Each run has one writer lock and a `watch`
//! channel. Writes go to the store first and are published to readers only
//! once persisted, so pollers and subscribers never see uncommitted state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use signalpress_common::config::StepWeights;
use signalpress_common::{
    GenerationProgress, GenerationStatus, GenerationStep, NewsletterKind, QualityMetrics,
};
use signalpress_store::Store;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no generation run with task id {0}")]
    UnknownTask(Uuid),
    #[error("cannot move back from step {current} to {requested}")]
    StepRegression {
        current: GenerationStep,
        requested: GenerationStep,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(GenerationProgress),
    /// The run was already terminal; nothing changed.
    IgnoredTerminal,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

struct Slot {
    tx: watch::Sender<GenerationProgress>,
    write: Mutex<()>,
}

pub struct ProgressTracker {
    store: Arc<dyn Store>,
    weights: StepWeights,
    slots: RwLock<HashMap<Uuid, Arc<Slot>>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn Store>, weights: StepWeights) -> Self {
        Self {
            store,
            weights,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(
        &self,
        task_id: Uuid,
        kind: NewsletterKind,
    ) -> Result<GenerationProgress, ProgressError> {
        let progress = GenerationProgress::new(task_id, kind, Utc::now());
        self.store.save_progress(&progress).await?;
        let (tx, _) = watch::channel(progress.clone());
        self.slots.write().await.insert(
            task_id,
            Arc::new(Slot {
                tx,
                write: Mutex::new(()),
            }),
        );
        info!(%task_id, %kind, "Generation run started");
        Ok(progress)
    }

    /// Report progress within `step`. Moving to a later step marks every
    /// earlier step complete; moving to an earlier one is rejected.
    pub async fn update(
        &self,
        task_id: Uuid,
        step: GenerationStep,
        step_progress: f64,
        details: Value,
        intermediate: Option<Value>,
    ) -> Result<UpdateOutcome, ProgressError> {
        let weights = self.weights;
        self.mutate(task_id, move |p, now| {
            if step < p.current_step {
                return Err(ProgressError::StepRegression {
                    current: p.current_step,
                    requested: step,
                });
            }
            let step_progress = step_progress.clamp(0.0, 1.0);
            let overall = weights.completed_before(step) + weights.weight(step) * step_progress;

            p.current_step = step;
            p.step_progress = step_progress;
            p.overall_progress = overall.clamp(p.overall_progress, 1.0);
            merge_details(&mut p.step_details, details);
            if let Some(preview) = intermediate {
                p.intermediate_results
                    .insert(step.as_str().to_string(), preview);
            }
            p.estimated_completion = estimate_completion(p.started_at, p.overall_progress, now);
            Ok(())
        })
        .await
    }

    /// Attach quality measurements.
    pub async fn record_quality(
        &self,
        task_id: Uuid,
        metrics: QualityMetrics,
    ) -> Result<UpdateOutcome, ProgressError> {
        self.mutate(task_id, move |p, _| {
            p.quality_metrics = metrics;
            Ok(())
        })
        .await
    }

    /// Record why a quality gate degraded the run.
    pub async fn record_degradation(
        &self,
        task_id: Uuid,
        reason: String,
    ) -> Result<UpdateOutcome, ProgressError> {
        self.mutate(task_id, move |p, _| {
            p.degradations.push(reason);
            Ok(())
        })
        .await
    }

    pub async fn complete(
        &self,
        task_id: Uuid,
        newsletter_id: Uuid,
    ) -> Result<UpdateOutcome, ProgressError> {
        let outcome = self
            .mutate(task_id, move |p, now| {
                p.current_step = GenerationStep::Storage;
                p.step_progress = 1.0;
                p.overall_progress = 1.0;
                p.status = GenerationStatus::Complete;
                p.newsletter_id = Some(newsletter_id);
                p.estimated_completion = Some(now);
                Ok(())
            })
            .await?;
        if outcome.is_applied() {
            info!(%task_id, %newsletter_id, "Generation run complete");
        }
        Ok(outcome)
    }

    pub async fn fail(&self, task_id: Uuid, reason: &str) -> Result<UpdateOutcome, ProgressError> {
        let reason = reason.to_string();
        let logged = reason.clone();
        let outcome = self
            .mutate(task_id, move |p, _| {
                p.status = GenerationStatus::Failed;
                p.estimated_completion = None;
                merge_details(
                    &mut p.step_details,
                    serde_json::json!({ "failure_reason": reason }),
                );
                Ok(())
            })
            .await?;
        if outcome.is_applied() {
            warn!(%task_id, reason = %logged, "Generation run failed");
        }
        Ok(outcome)
    }

    /// Latest committed state.
    pub async fn read(&self, task_id: Uuid) -> Result<Option<GenerationProgress>, ProgressError> {
        if let Some(slot) = self.slots.read().await.get(&task_id) {
            return Ok(Some(slot.tx.borrow().clone()));
        }
        Ok(self.store.load_progress(task_id).await?)
    }

    /// Stream of successive states. The receiver starts at the current state.
    pub async fn subscribe(
        &self,
        task_id: Uuid,
    ) -> Result<watch::Receiver<GenerationProgress>, ProgressError> {
        Ok(self.slot(task_id).await?.tx.subscribe())
    }

    /// Runs not yet terminal, as recorded in the store.
    pub async fn active(&self) -> Result<Vec<GenerationProgress>, ProgressError> {
        Ok(self.store.active_progress().await?)
    }

    /// Drop terminal runs last updated before `cutoff`.
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ProgressError> {
        let removed = self.store.purge_terminal_before(cutoff).await?;
        self.slots.write().await.retain(|_, slot| {
            let p = slot.tx.borrow();
            !(p.is_terminal() && p.updated_at < cutoff)
        });
        if removed > 0 {
            info!(removed, "Purged old generation progress");
        }
        Ok(removed)
    }

    async fn slot(&self, task_id: Uuid) -> Result<Arc<Slot>, ProgressError> {
        if let Some(slot) = self.slots.read().await.get(&task_id) {
            return Ok(slot.clone());
        }
        let progress = self
            .store
            .load_progress(task_id)
            .await?
            .ok_or(ProgressError::UnknownTask(task_id))?;

        let mut slots = self.slots.write().await;
        let slot = slots.entry(task_id).or_insert_with(|| {
            let (tx, _) = watch::channel(progress);
            Arc::new(Slot {
                tx,
                write: Mutex::new(()),
            })
        });
        Ok(slot.clone())
    }

    async fn mutate<F>(&self, task_id: Uuid, apply: F) -> Result<UpdateOutcome, ProgressError>
    where
        F: FnOnce(&mut GenerationProgress, DateTime<Utc>) -> Result<(), ProgressError> + Send,
    {
        let slot = self.slot(task_id).await?;
        let _guard = slot.write.lock().await;

        let mut next = slot.tx.borrow().clone();
        if next.is_terminal() {
            debug!(%task_id, "Ignoring write to terminal generation run");
            return Ok(UpdateOutcome::IgnoredTerminal);
        }

        let now = Utc::now();
        apply(&mut next, now)?;
        next.updated_at = now;

        self.store.save_progress(&next).await?;
        slot.tx.send_replace(next.clone());
        Ok(UpdateOutcome::Applied(next))
    }
}

fn merge_details(target: &mut Value, details: Value) {
    match (target.as_object_mut(), details) {
        (Some(obj), Value::Object(incoming)) => {
            for (k, v) in incoming {
                obj.insert(k, v);
            }
        }
        (_, Value::Null) => {}
        (_, other) => {
            *target = serde_json::json!({ "detail": other });
        }
    }
}

/// Linear extrapolation from elapsed time and overall progress.
fn estimate_completion(
    started_at: DateTime<Utc>,
    overall: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if overall <= 0.0 || overall >= 1.0 {
        return None;
    }
    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let total_ms = elapsed_ms / overall;
    Some(started_at + Duration::milliseconds(total_ms as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalpress_store::{MemoryStore, ProgressStore};

    fn tracker() -> (ProgressTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ProgressTracker::new(store.clone(), StepWeights::default()),
            store,
        )
    }

    #[tokio::test]
    async fn overall_progress_is_weighted_and_never_drops() {
        let (tracker, _) = tracker();
        let id = Uuid::new_v4();
        tracker.start(id, NewsletterKind::Daily).await.unwrap();

        let mut last = 0.0;
        let steps = [
            (GenerationStep::Selection, 1.0),
            (GenerationStep::Synthesis, 0.5),
            (GenerationStep::Writing, 0.6),
            (GenerationStep::Writing, 0.2),
            (GenerationStep::Storage, 0.0),
        ];
        for (step, fraction) in steps {
            let outcome = tracker
                .update(id, step, fraction, json!({}), None)
                .await
                .unwrap();
            let UpdateOutcome::Applied(p) = outcome else {
                panic!("update ignored");
            };
            assert!(p.overall_progress >= last, "progress dropped");
            last = p.overall_progress;
        }
        // selection + synthesis + writing all complete
        assert!((last - 0.90).abs() < 1e-9);
    }

    #[tokio::test]
    async fn earlier_step_is_rejected() {
        let (tracker, _) = tracker();
        let id = Uuid::new_v4();
        tracker.start(id, NewsletterKind::Daily).await.unwrap();
        tracker
            .update(id, GenerationStep::Writing, 0.1, json!({}), None)
            .await
            .unwrap();

        let err = tracker
            .update(id, GenerationStep::Selection, 1.0, json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::StepRegression { .. }));

        let p = tracker.read(id).await.unwrap().unwrap();
        assert_eq!(p.current_step, GenerationStep::Writing);
    }

    #[tokio::test]
    async fn terminal_run_ignores_further_writes() {
        let (tracker, _) = tracker();
        let id = Uuid::new_v4();
        tracker.start(id, NewsletterKind::Weekly).await.unwrap();
        tracker.fail(id, "only 2 citations").await.unwrap();
        let failed = tracker.read(id).await.unwrap().unwrap();

        assert_eq!(
            tracker
                .update(id, GenerationStep::Storage, 1.0, json!({}), None)
                .await
                .unwrap(),
            UpdateOutcome::IgnoredTerminal
        );
        assert_eq!(
            tracker.complete(id, Uuid::new_v4()).await.unwrap(),
            UpdateOutcome::IgnoredTerminal
        );
        assert_eq!(tracker.read(id).await.unwrap().unwrap(), failed);
        assert_eq!(failed.failure_reason(), Some("only 2 citations"));
    }

    #[tokio::test]
    async fn writes_are_persisted_before_publish() {
        let (tracker, store) = tracker();
        let id = Uuid::new_v4();
        tracker.start(id, NewsletterKind::Daily).await.unwrap();
        let mut rx = tracker.subscribe(id).await.unwrap();

        tracker
            .update(
                id,
                GenerationStep::Selection,
                1.0,
                json!({"items_selected": 12}),
                Some(json!(["a", "b"])),
            )
            .await
            .unwrap();

        rx.changed().await.unwrap();
        let published = rx.borrow().clone();
        let stored = store.load_progress(id).await.unwrap().unwrap();
        assert_eq!(published, stored);
        assert_eq!(stored.step_details["items_selected"], 12);
        assert!(stored.intermediate_results.contains_key("selection"));
    }

    #[tokio::test]
    async fn runs_are_readable_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        {
            let tracker = ProgressTracker::new(store.clone(), StepWeights::default());
            tracker.start(id, NewsletterKind::Daily).await.unwrap();
        }
        let fresh = ProgressTracker::new(store, StepWeights::default());
        assert!(fresh.read(id).await.unwrap().is_some());
        assert!(fresh
            .update(id, GenerationStep::Synthesis, 0.5, json!({}), None)
            .await
            .unwrap()
            .is_applied());
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let (tracker, _) = tracker();
        let err = tracker.subscribe(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ProgressError::UnknownTask(_)));
    }

    #[test]
    fn completion_estimate_extrapolates_linearly() {
        let start = Utc::now();
        let now = start + Duration::seconds(30);
        let eta = estimate_completion(start, 0.25, now).unwrap();
        assert_eq!((eta - start).num_seconds(), 120);
        assert!(estimate_completion(start, 0.0, now).is_none());
    }
}
