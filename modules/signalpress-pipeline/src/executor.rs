use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::batch::BatchWorker;
use crate::deps::PipelineDeps;
use crate::generation::GenerationRunner;
use crate::queue::{Task, TaskExecutor};

/// Routes queued tasks to the batch worker or the generation runner.
pub struct PipelineExecutor {
    worker: BatchWorker,
    runner: Arc<GenerationRunner>,
}

impl PipelineExecutor {
    pub fn new(deps: PipelineDeps, runner: Arc<GenerationRunner>) -> Self {
        Self {
            worker: BatchWorker::new(deps),
            runner,
        }
    }
}

#[async_trait]
impl TaskExecutor for PipelineExecutor {
    async fn execute(&self, task: Task) -> Result<()> {
        match task {
            Task::AnalyzeBatch(batch) => {
                self.worker.run(&batch).await?;
            }
            Task::Generate(generation) => {
                self.runner.run(&generation).await?;
            }
        }
        Ok(())
    }
}
