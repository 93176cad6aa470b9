use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use signalpress_common::{
    mean, GenerationStep, Newsletter, NewsletterKind, QualityMetrics,
};

use crate::deps::PipelineDeps;
use crate::generation::progress::{ProgressError, UpdateOutcome};
use crate::generation::quality_gate::{GateVerdict, QualityGate};
use crate::queue::{GenerationTask, Task};
use crate::traits::{Draft, SelectedItem, Synthesis};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("a {kind} newsletter for {period_key} already exists")]
    AlreadyGenerated {
        kind: NewsletterKind,
        period_key: String,
        newsletter_id: Uuid,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ProgressError> for GenerateError {
    fn from(e: ProgressError) -> Self {
        GenerateError::Internal(e.into())
    }
}

/// Result of a submit call.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub task_id: Uuid,
    /// True when an in-flight run of the same kind was returned instead of starting a new one.
    pub existing: bool,
}

/// Stops a run without failing it: the run already went terminal, or another
/// delivery of the task has moved it further along.
#[derive(Debug, Error)]
#[error("run is no longer in progress")]
struct RunSuperseded;

/// Drives generation runs: submission, then the four steps with a quality
/// gate after each of the first three.
pub struct GenerationRunner {
    deps: PipelineDeps,
    gate: QualityGate,
    submit_lock: Mutex<()>,
}

impl GenerationRunner {
    pub fn new(deps: PipelineDeps) -> Self {
        let gate = QualityGate::new(deps.config.quality.clone());
        Self {
            deps,
            gate,
            submit_lock: Mutex::new(()),
        }
    }

    /// Start a run for `kind`, or return the one already in flight.
    pub async fn submit(&self, kind: NewsletterKind, force: bool) -> Result<Submitted, GenerateError> {
        let _guard = self.submit_lock.lock().await;

        if let Some(active) = self
            .deps
            .progress
            .active()
            .await?
            .into_iter()
            .find(|p| p.kind == kind)
        {
            info!(task_id = %active.task_id, %kind, "Run already in progress");
            return Ok(Submitted {
                task_id: active.task_id,
                existing: true,
            });
        }

        let period_key = kind.period_key(Utc::now());
        if !force {
            if let Some(existing) = self.deps.store.find_newsletter(kind, &period_key).await? {
                return Err(GenerateError::AlreadyGenerated {
                    kind,
                    period_key,
                    newsletter_id: existing.id,
                });
            }
        }

        let task_id = Uuid::new_v4();
        self.deps.progress.start(task_id, kind).await?;
        let task = Task::Generate(GenerationTask { task_id, kind });
        if let Err(e) = self.deps.queue.enqueue(task, Duration::ZERO).await {
            self.deps
                .progress
                .fail(task_id, &format!("could not enqueue run: {e:#}"))
                .await?;
            return Err(e.into());
        }

        Ok(Submitted {
            task_id,
            existing: false,
        })
    }

    /// Execute a queued run. Step and gate failures end the run as FAILED and
    /// are not errors here; only tracker or store faults are returned.
    pub async fn run(&self, task: &GenerationTask) -> Result<()> {
        let Some(progress) = self.deps.progress.read(task.task_id).await? else {
            warn!(task_id = %task.task_id, "Generation task without progress record, dropping");
            return Ok(());
        };
        if progress.is_terminal() {
            return Ok(());
        }
        if progress.current_step != GenerationStep::Selection || progress.step_progress > 0.0 {
            info!(
                task_id = %task.task_id,
                step = %progress.current_step,
                "Run already started by an earlier delivery, skipping"
            );
            return Ok(());
        }

        match self.execute(task).await {
            Ok(newsletter_id) => {
                self.deps
                    .progress
                    .complete(task.task_id, newsletter_id)
                    .await?;
            }
            Err(e) if e.is::<RunSuperseded>() => {
                info!(task_id = %task.task_id, "Run ended or advanced elsewhere, stopping");
            }
            Err(e) => {
                self.deps
                    .progress
                    .fail(task.task_id, &format!("{e:#}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn execute(&self, task: &GenerationTask) -> Result<Uuid> {
        let GenerationTask { task_id, kind } = *task;
        let mut degradations = Vec::new();

        // Selection
        self.report(task_id, GenerationStep::Selection, 0.0, json!({}), None)
            .await?;
        let since = Utc::now() - kind.lookback();
        let mut candidates = self.deps.store.analyzed_items_since(since).await?;
        let considered = candidates.len();
        candidates.sort_by(|a, b| {
            b.signal_strength
                .total_cmp(&a.signal_strength)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        candidates.truncate(self.deps.config.generation.max_selected_items);
        let selected: Vec<SelectedItem> = candidates;
        self.report(
            task_id,
            GenerationStep::Selection,
            1.0,
            json!({ "items_considered": considered, "items_selected": selected.len() }),
            Some(json!(selected.iter().map(|i| &i.title).collect::<Vec<_>>())),
        )
        .await?;
        self.apply_gate(task_id, self.gate.check_selection(&selected), &mut degradations)
            .await?;

        // Synthesis
        self.report(task_id, GenerationStep::Synthesis, 0.0, json!({}), None)
            .await?;
        let synthesis: Synthesis = self
            .with_stage_timeout("synthesis", self.deps.composer.synthesize(&selected))
            .await?;
        self.report(
            task_id,
            GenerationStep::Synthesis,
            1.0,
            json!({ "themes": synthesis.themes.len(), "coherence": synthesis.coherence }),
            Some(json!(synthesis
                .themes
                .iter()
                .map(|t| &t.title)
                .collect::<Vec<_>>())),
        )
        .await?;
        self.apply_gate(task_id, self.gate.check_synthesis(&synthesis), &mut degradations)
            .await?;

        // Writing
        self.report(task_id, GenerationStep::Writing, 0.0, json!({}), None)
            .await?;
        let draft: Draft = self
            .with_stage_timeout(
                "writing",
                self.deps.composer.write(kind, &synthesis, &selected),
            )
            .await?;
        let check = self.gate.check_writing(&draft, &selected);
        let metrics = QualityMetrics {
            confidence: run_confidence(&selected, synthesis.coherence),
            signal_strength: mean(selected.iter().map(|i| i.signal_strength)).unwrap_or(0.0),
            citation_count: check.resolved_citations,
            word_count: check.word_count,
        };
        let outcome = self
            .deps
            .progress
            .record_quality(task_id, metrics.clone())
            .await?;
        applied(outcome)?;
        self.report(
            task_id,
            GenerationStep::Writing,
            1.0,
            json!({
                "word_count": check.word_count,
                "citations": check.resolved_citations,
                "unresolved_citations": check.unresolved_citations,
            }),
            Some(json!({ "title": draft.title })),
        )
        .await?;
        self.apply_gate(task_id, check.verdict, &mut degradations)
            .await?;

        // Storage
        self.report(task_id, GenerationStep::Storage, 0.0, json!({}), None)
            .await?;
        let newsletter = Newsletter {
            id: Uuid::new_v4(),
            kind,
            period_key: kind.period_key(Utc::now()),
            title: draft.title,
            body: draft.body,
            citations: draft.citations,
            quality_metrics: metrics,
            degradations,
            task_id,
            created_at: Utc::now(),
        };
        self.deps.store.save_newsletter(&newsletter).await?;
        self.report(
            task_id,
            GenerationStep::Storage,
            1.0,
            json!({ "newsletter_id": newsletter.id }),
            None,
        )
        .await?;

        info!(
            %task_id,
            newsletter_id = %newsletter.id,
            confidence = newsletter.quality_metrics.confidence,
            citations = newsletter.quality_metrics.citation_count,
            "Newsletter stored"
        );
        Ok(newsletter.id)
    }

    async fn report(
        &self,
        task_id: Uuid,
        step: GenerationStep,
        fraction: f64,
        details: serde_json::Value,
        preview: Option<serde_json::Value>,
    ) -> Result<()> {
        match self
            .deps
            .progress
            .update(task_id, step, fraction, details, preview)
            .await
        {
            Ok(outcome) => applied(outcome),
            // Another delivery of the same task is further along.
            Err(ProgressError::StepRegression { current, requested }) => {
                info!(%task_id, %current, %requested, "Run advanced by another delivery");
                Err(anyhow!(RunSuperseded))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_gate(
        &self,
        task_id: Uuid,
        verdict: GateVerdict,
        degradations: &mut Vec<String>,
    ) -> Result<()> {
        match verdict {
            GateVerdict::Pass => Ok(()),
            GateVerdict::Degraded(reason) => {
                warn!(%task_id, %reason, "Quality gate degraded");
                degradations.push(reason.clone());
                let outcome = self.deps.progress.record_degradation(task_id, reason).await?;
                applied(outcome)
            }
            GateVerdict::Fail(reason) => bail!("quality gate failed: {reason}"),
        }
    }

    async fn with_stage_timeout<T>(
        &self,
        stage: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.deps.config.generation.stage_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.context(format!("{stage} failed"))),
            Err(_) => bail!("{stage} timed out after {}s", limit.as_secs()),
        }
    }
}

fn applied(outcome: UpdateOutcome) -> Result<()> {
    match outcome {
        UpdateOutcome::Applied(_) => Ok(()),
        UpdateOutcome::IgnoredTerminal => Err(anyhow!(RunSuperseded)),
    }
}

/// Overall confidence: the mean of item confidence and synthesis coherence.
fn run_confidence(items: &[SelectedItem], coherence: f64) -> f64 {
    let item_confidence = mean(items.iter().map(|i| i.confidence)).unwrap_or(0.0);
    ((item_confidence + coherence) / 2.0).clamp(0.0, 1.0)
}
