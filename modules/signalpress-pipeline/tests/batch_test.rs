//! Batch analysis end to end against the in-memory store: initiate a session,
//! run the batches it enqueued, and check what was finalized.

use std::sync::Arc;
use std::time::Duration;

use signalpress_common::{FileConfig, RecordStatus, SessionStatus, Usd};
use signalpress_pipeline::batch::{BatchOrchestrator, BatchWorker, InitiateBatch, InitiateError};
use signalpress_pipeline::testing::{
    store_with_articles, test_deps, ItemBehavior, MockAnalyzer, MockComposer, RecordingQueue,
};
use signalpress_pipeline::{PipelineDeps, Task};
use signalpress_store::{MemoryStore, SessionStore};

const ITEM_COST: f64 = 0.0013;

struct Harness {
    deps: PipelineDeps,
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    analyzer: Arc<MockAnalyzer>,
}

impl Harness {
    async fn new(articles: i64, analyzer: MockAnalyzer) -> Self {
        Self::with_config(articles, analyzer, FileConfig::default()).await
    }

    async fn with_config(articles: i64, analyzer: MockAnalyzer, config: FileConfig) -> Self {
        let store = store_with_articles(articles).await;
        let queue = Arc::new(RecordingQueue::new());
        let analyzer = Arc::new(analyzer);
        let deps = test_deps(
            store.clone(),
            analyzer.clone(),
            Arc::new(MockComposer::new()),
            queue.clone(),
            config,
        );
        Self {
            deps,
            store,
            queue,
            analyzer,
        }
    }

    fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(self.deps.clone())
    }

    /// Run every enqueued batch in order, ignoring delays.
    async fn drain(&self) {
        let worker = BatchWorker::new(self.deps.clone());
        for (task, _) in self.queue.take() {
            if let Task::AnalyzeBatch(batch) = task {
                worker.run(&batch).await.unwrap();
            }
        }
    }
}

fn request(cap: f64) -> InitiateBatch {
    InitiateBatch {
        budget_cap: Usd::from_dollars(cap),
        batch_size: Some(10),
        max_items: None,
    }
}

#[tokio::test]
async fn generous_budget_completes_every_item() {
    let h = Harness::new(10, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    let session = h.orchestrator().initiate(request(0.30)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(h.queue.len(), 1);

    h.drain().await;

    let view = h.orchestrator().summary(session.id).await.unwrap().unwrap();
    assert_eq!(view.session.status, SessionStatus::Completed);
    assert_eq!(view.counts.succeeded, 10);
    assert_eq!(view.session.budget_spent, Usd::from_dollars(0.013));
    assert_eq!(view.budget_utilization_pct, 4.3);

    let summary = view.session.summary.expect("finalized sessions carry a summary");
    assert_eq!(summary.total_items, 10);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(h.analyzer.calls(), 10);
}

#[tokio::test]
async fn tight_budget_truncates_and_never_overspends() {
    let h = Harness::new(10, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    let session = h.orchestrator().initiate(request(0.01)).await.unwrap();
    assert!(session.truncated);
    assert_eq!(session.status, SessionStatus::PartiallyComplete);

    let tasks = h.queue.take();
    assert_eq!(tasks.len(), 1);
    let Task::AnalyzeBatch(batch) = &tasks[0].0 else {
        panic!("expected a batch task");
    };
    assert_eq!(batch.record_ids.len(), 7);

    BatchWorker::new(h.deps.clone()).run(batch).await.unwrap();

    let view = h.orchestrator().summary(session.id).await.unwrap().unwrap();
    assert_eq!(view.session.status, SessionStatus::PartiallyComplete);
    assert_eq!(view.counts.succeeded, 7);
    assert_eq!(view.counts.abandoned, 3);
    assert!(view.session.budget_spent <= view.session.budget_cap);
    assert!(view.session.finalized_at.is_some());

    let records = h.store.records_for_session(session.id).await.unwrap();
    assert!(records[7..]
        .iter()
        .all(|r| r.status == RecordStatus::Abandoned
            && r.last_error.as_deref() == Some("budget exhausted")));
}

#[tokio::test]
async fn actual_cost_above_estimate_halts_mid_batch() {
    let h = Harness::new(10, MockAnalyzer::new(Usd::from_dollars(0.003))).await;

    let session = h.orchestrator().initiate(request(0.01)).await.unwrap();
    h.drain().await;

    let view = h.orchestrator().summary(session.id).await.unwrap().unwrap();
    assert_eq!(view.counts.succeeded, 3);
    assert_eq!(view.counts.abandoned, 7);
    assert_eq!(view.session.budget_spent, Usd::from_dollars(0.009));
    assert!(view.session.budget_spent <= view.session.budget_cap);
    assert_eq!(view.session.status, SessionStatus::PartiallyComplete);
    // Halting stops further calls once a reservation is refused.
    assert_eq!(h.analyzer.calls(), 3);
}

#[tokio::test]
async fn failing_item_does_not_affect_its_batch() {
    let analyzer = MockAnalyzer::new(Usd::from_dollars(ITEM_COST)).on_item(3, ItemBehavior::Fail);
    let h = Harness::new(10, analyzer).await;

    let session = h.orchestrator().initiate(request(0.30)).await.unwrap();
    h.drain().await;

    let view = h.orchestrator().summary(session.id).await.unwrap().unwrap();
    assert_eq!(view.counts.succeeded, 9);
    assert_eq!(view.counts.failed, 1);
    // The failed record still has retries left, so the session stays open.
    assert_eq!(view.session.status, SessionStatus::Running);
    assert!(view.session.finalized_at.is_none());

    let records = h.store.records_for_session(session.id).await.unwrap();
    let failed = records.iter().find(|r| r.item_id == 3).unwrap();
    assert_eq!(failed.status, RecordStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.last_error.as_deref().unwrap().contains("500"));
}

#[tokio::test(start_paused = true)]
async fn hung_item_times_out_and_fails() {
    let analyzer = MockAnalyzer::new(Usd::from_dollars(ITEM_COST)).on_item(2, ItemBehavior::Hang);
    let h = Harness::new(3, analyzer).await;

    let session = h.orchestrator().initiate(request(0.30)).await.unwrap();
    h.drain().await;

    let records = h.store.records_for_session(session.id).await.unwrap();
    let hung = records.iter().find(|r| r.item_id == 2).unwrap();
    assert_eq!(hung.status, RecordStatus::Failed);
    assert_eq!(
        hung.last_error.as_deref(),
        Some("analysis timed out after 60s")
    );
    assert_eq!(
        records
            .iter()
            .filter(|r| r.status == RecordStatus::Succeeded)
            .count(),
        2
    );

    // The timed-out call's reservation was released, not charged.
    let session = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(session.budget_spent, Usd::from_dollars(0.0026));
}

#[tokio::test]
async fn no_candidates_completes_immediately() {
    let h = Harness::new(0, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    let session = h.orchestrator().initiate(request(1.0)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.finalized_at.is_some());
    assert!(h.queue.is_empty());
    assert_eq!(session.summary.unwrap().total_items, 0);
}

#[tokio::test]
async fn batches_are_spaced_by_the_inter_batch_delay() {
    let h = Harness::new(25, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    h.orchestrator().initiate(request(1.0)).await.unwrap();

    let delays: Vec<Duration> = h.queue.take().into_iter().map(|(_, d)| d).collect();
    assert_eq!(
        delays,
        vec![
            Duration::ZERO,
            Duration::from_secs(30),
            Duration::from_secs(60)
        ]
    );
}

#[tokio::test]
async fn already_analyzed_items_are_not_selected_again() {
    let h = Harness::new(5, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    let first = h.orchestrator().initiate(request(1.0)).await.unwrap();
    h.drain().await;
    assert_eq!(first.item_ids.len(), 5);

    let second = h.orchestrator().initiate(request(1.0)).await.unwrap();
    assert!(second.item_ids.is_empty());
    assert_eq!(second.status, SessionStatus::Completed);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let h = Harness::new(5, MockAnalyzer::new(Usd::from_dollars(ITEM_COST))).await;

    let err = h.orchestrator().initiate(request(0.0)).await.unwrap_err();
    assert!(matches!(err, InitiateError::InvalidBudget));

    let err = h
        .orchestrator()
        .initiate(InitiateBatch {
            budget_cap: Usd::from_dollars(1.0),
            batch_size: Some(0),
            max_items: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, InitiateError::InvalidBatchSize));
}

#[tokio::test]
async fn concurrent_workers_share_one_ledger() {
    let mut config = FileConfig::default();
    config.batch.worker_concurrency = 4;
    let h = Harness::with_config(
        20,
        MockAnalyzer::new(Usd::from_dollars(ITEM_COST)),
        config,
    )
    .await;

    let session = h
        .orchestrator()
        .initiate(InitiateBatch {
            budget_cap: Usd::from_dollars(0.02),
            batch_size: Some(5),
            max_items: None,
        })
        .await
        .unwrap();

    let worker = BatchWorker::new(h.deps.clone());
    let runs = h.queue.take().into_iter().filter_map(|(task, _)| match task {
        Task::AnalyzeBatch(batch) => Some(batch),
        Task::Generate(_) => None,
    });
    let handles: Vec<_> = runs
        .map(|batch| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(&batch).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let view = h.orchestrator().summary(session.id).await.unwrap().unwrap();
    assert!(view.session.budget_spent <= view.session.budget_cap);
    assert_eq!(view.counts.succeeded, 15);
    assert_eq!(view.counts.abandoned, 5);
    assert_eq!(view.session.status, SessionStatus::PartiallyComplete);
}
