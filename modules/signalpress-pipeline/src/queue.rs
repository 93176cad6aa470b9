//! Task queue: the worker-pool boundary.
//!
//! Tasks carry their whole payload, so any executor that can see the store can
//! run them. [`LocalQueue`] is the in-process implementation: named queues with
//! independent concurrency limits, delayed delivery, and at-least-once
//! redelivery when an execution errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use signalpress_common::NewsletterKind;

pub const ANALYSIS_QUEUE: &str = "analysis";
pub const GENERATION_QUEUE: &str = "generation";

/// Delay before an errored task is handed back to its queue.
const REDELIVERY_DELAY: Duration = Duration::from_secs(5);

/// One batch of records to analyze.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub session_id: Uuid,
    pub record_ids: Vec<Uuid>,
    pub batch_index: usize,
    /// Set when the recovery sweep re-enqueues failed records.
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub task_id: Uuid,
    pub kind: NewsletterKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    AnalyzeBatch(BatchTask),
    Generate(GenerationTask),
}

impl Task {
    pub fn queue_name(&self) -> &'static str {
        match self {
            Task::AnalyzeBatch(_) => ANALYSIS_QUEUE,
            Task::Generate(_) => GENERATION_QUEUE,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule `task` to run after `delay`. Returns without waiting for it to run.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<()>;
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: Task) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LocalQueue
// ---------------------------------------------------------------------------

struct Delivery {
    task: Task,
    attempt: u32,
}

pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    limits: HashMap<&'static str, Arc<Semaphore>>,
    max_deliveries: u32,
}

impl LocalQueue {
    pub fn new(analysis_concurrency: usize, generation_concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let limits = HashMap::from([
            (ANALYSIS_QUEUE, Arc::new(Semaphore::new(analysis_concurrency.max(1)))),
            (GENERATION_QUEUE, Arc::new(Semaphore::new(generation_concurrency.max(1)))),
        ]);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            limits,
            max_deliveries: 3,
        }
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Begin dispatching to `executor`. Tasks enqueued before this call are
    /// buffered and delivered once it runs. Can be started once.
    pub async fn start(&self, executor: Arc<dyn TaskExecutor>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("task queue already started"))?;
        let tx = self.tx.clone();
        let limits = self.limits.clone();
        let max_deliveries = self.max_deliveries;

        info!(queues = limits.len(), "Task queue started");

        Ok(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let queue = delivery.task.queue_name();
                let Some(limit) = limits.get(queue).cloned() else {
                    error!(queue, "No such queue, dropping task");
                    continue;
                };
                let executor = executor.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = limit.acquire_owned().await else {
                        return;
                    };
                    let Delivery { task, attempt } = delivery;
                    if let Err(e) = executor.execute(task.clone()).await {
                        if attempt + 1 < max_deliveries {
                            warn!(queue, attempt, error = %e, "Task failed, redelivering");
                            tokio::spawn(async move {
                                tokio::time::sleep(REDELIVERY_DELAY).await;
                                let _ = tx.send(Delivery {
                                    task,
                                    attempt: attempt + 1,
                                });
                            });
                        } else {
                            error!(queue, attempt, error = %e, "Task failed, giving up");
                        }
                    }
                });
            }
        }))
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<()> {
        let delivery = Delivery { task, attempt: 0 };
        if delay.is_zero() {
            self.tx
                .send(delivery)
                .map_err(|_| anyhow!("task queue is closed"))?;
            return Ok(());
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(delivery);
        });
        Ok(())
    }
}
