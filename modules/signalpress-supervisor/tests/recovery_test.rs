//! Recovery sweep against the in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use signalpress_common::{
    Alert, AlertSeverity, AlertType, AnalysisRecord, BatchRecord, BatchSession, FileConfig, GenerationProgress,
    GenerationStatus, NewsletterKind, RecordStatus, SessionStatus, Usd,
};
use signalpress_pipeline::testing::{
    analysis_output, store_with_articles, test_deps, ItemBehavior, MockAnalyzer, MockComposer,
    RecordingQueue,
};
use signalpress_pipeline::batch::BatchWorker;
use signalpress_pipeline::{BatchTask, Task};
use signalpress_store::{AlertStore, AnalysisStore, MemoryStore, ProgressStore, SessionStore};
use signalpress_supervisor::notify::AlertNotifier;
use signalpress_supervisor::RecoverySweeper;

#[derive(Default)]
struct CapturingNotifier {
    sent: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertNotifier for CapturingNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    notifier: Arc<CapturingNotifier>,
    sweeper: RecoverySweeper,
}

async fn harness() -> Harness {
    let store = store_with_articles(10).await;
    let queue = Arc::new(RecordingQueue::new());
    let notifier = Arc::new(CapturingNotifier::default());
    let deps = test_deps(
        store.clone(),
        Arc::new(MockAnalyzer::new(Usd::from_dollars(0.0013))),
        Arc::new(MockComposer::new()),
        queue.clone(),
        FileConfig::default(),
    );
    let sweeper = RecoverySweeper::new(deps, notifier.clone());
    Harness {
        store,
        queue,
        notifier,
        sweeper,
    }
}

/// A RUNNING session over items `1..=n`, created at `at`.
async fn running_session(
    store: &MemoryStore,
    n: i64,
    at: DateTime<Utc>,
) -> (BatchSession, Vec<BatchRecord>) {
    let session = BatchSession::new(Usd::from_dollars(1.0), 10, (1..=n).collect(), at);
    let records: Vec<BatchRecord> = session
        .item_ids
        .iter()
        .map(|id| BatchRecord::new(session.id, *id, at))
        .collect();
    store.create_session(&session, &records).await.unwrap();
    store
        .transition_session(session.id, SessionStatus::Running, at)
        .await
        .unwrap();
    (session, records)
}

async fn fail_at(store: &MemoryStore, record: &BatchRecord, at: DateTime<Utc>) {
    assert!(store.claim_record(record.id, at).await.unwrap());
    assert!(store.fail_record(record.id, "upstream 503", at).await.unwrap());
}

async fn succeed_at(store: &MemoryStore, record: &BatchRecord, at: DateTime<Utc>) {
    assert!(store.claim_record(record.id, at).await.unwrap());
    let (row, signals) = AnalysisRecord::from_output(
        record,
        &analysis_output(record.item_id, 0.7),
        Usd::from_dollars(0.0013),
        at,
    );
    assert!(store
        .record_analysis(&row, &signals, Usd::from_dollars(0.0013), at)
        .await
        .unwrap());
}

#[tokio::test]
async fn exactly_the_due_failed_records_are_reset() {
    let h = harness().await;
    let now = Utc::now();
    let (session, records) = running_session(&h.store, 7, now - Duration::minutes(10)).await;

    // Three failures whose 120s backoff has elapsed.
    for record in &records[..3] {
        fail_at(&h.store, record, now - Duration::minutes(5)).await;
    }
    // One recent in-flight attempt, one pending, one failed too recently,
    // and one that succeeded long enough ago to look due.
    h.store.claim_record(records[3].id, now).await.unwrap();
    fail_at(&h.store, &records[5], now - Duration::seconds(30)).await;
    succeed_at(&h.store, &records[6], now - Duration::minutes(5)).await;

    let stats = h.sweeper.sweep(now).await.unwrap();
    assert_eq!(stats.records_reset, 3);
    assert_eq!(stats.attempts_failed, 0);

    let after = h.store.records_for_session(session.id).await.unwrap();
    for record in &after[..3] {
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempt_count, 1);
    }
    assert_eq!(after[3].status, RecordStatus::InProgress);
    assert_eq!(after[4].status, RecordStatus::Pending);
    assert_eq!(after[5].status, RecordStatus::Failed);
    assert_eq!(after[6].status, RecordStatus::Succeeded);
    assert_eq!(after[6].attempt_count, 1);

    let tasks = h.queue.take();
    assert_eq!(tasks.len(), 1);
    let (Task::AnalyzeBatch(batch), delay) = &tasks[0] else {
        panic!("expected a retry batch");
    };
    assert!(batch.retry);
    assert!(delay.is_zero());
    let expected: Vec<_> = records[..3].iter().map(|r| r.id).collect();
    assert_eq!(batch.record_ids, expected);
}

#[tokio::test]
async fn silent_running_session_is_stalled_with_a_critical_alert() {
    let h = harness().await;
    let now = Utc::now();
    let (session, _) = running_session(&h.store, 3, now - Duration::hours(3)).await;

    let stats = h.sweeper.sweep(now).await.unwrap();
    assert_eq!(stats.sessions_stalled, 1);

    let stalled = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stalled.status, SessionStatus::Stalled);
    assert!(stalled.is_live());

    let alerts = h.store.recent_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::StuckGeneration);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);

    // A second sweep does not stall or alert again.
    let again = h.sweeper.sweep(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(again.sessions_stalled, 0);
    assert_eq!(h.store.recent_alerts(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn abandoned_attempt_is_failed_then_retried() {
    let h = harness().await;
    let now = Utc::now();
    let (session, records) = running_session(&h.store, 1, now - Duration::hours(3)).await;
    h.store
        .claim_record(records[0].id, now - Duration::hours(3))
        .await
        .unwrap();

    let first = h.sweeper.sweep(now).await.unwrap();
    assert_eq!(first.attempts_failed, 1);
    let record = h.store.get_record(records[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("attempt stalled"));

    // Backoff for one attempt is 120s.
    let later = now + Duration::minutes(3);
    let second = h.sweeper.sweep(later).await.unwrap();
    assert_eq!(second.records_reset, 1);
    assert!(h
        .store
        .get_session(session.id)
        .await
        .unwrap()
        .unwrap()
        .is_live());
}

#[tokio::test]
async fn settled_session_is_finalized() {
    let h = harness().await;
    let now = Utc::now();
    let (session, records) = running_session(&h.store, 2, now - Duration::minutes(10)).await;
    // Both records fail three times, using up their retries.
    for record in &records {
        for attempt in 0..3 {
            fail_at(&h.store, record, now - Duration::minutes(5)).await;
            if attempt < 2 {
                h.store
                    .reset_failed_record(record.id, now - Duration::minutes(5))
                    .await
                    .unwrap();
            }
        }
    }

    let stats = h.sweeper.sweep(now).await.unwrap();
    assert_eq!(stats.records_reset, 0);
    assert_eq!(stats.sessions_finalized, 1);

    let done = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Failed);
    assert_eq!(done.summary.unwrap().failed, 2);
}

#[tokio::test]
async fn stuck_generation_run_is_failed() {
    let h = harness().await;
    let now = Utc::now();
    let progress = GenerationProgress::new(
        uuid::Uuid::new_v4(),
        NewsletterKind::Daily,
        now - Duration::hours(3),
    );
    h.store.save_progress(&progress).await.unwrap();

    let stats = h.sweeper.sweep(now).await.unwrap();
    assert_eq!(stats.runs_failed, 1);

    let failed = h.store.load_progress(progress.task_id).await.unwrap().unwrap();
    assert_eq!(failed.status, GenerationStatus::Failed);
    assert!(failed.failure_reason().unwrap().starts_with("stalled"));

    let alerts = h.store.recent_alerts(10).await.unwrap();
    assert_eq!(alerts[0].alert_type, AlertType::StuckGeneration);
}

#[tokio::test]
async fn failing_item_is_retried_until_exhausted_then_the_session_finalizes() {
    let store = store_with_articles(3).await;
    let queue = Arc::new(RecordingQueue::new());
    let config = FileConfig::default();
    let max_retries = config.recovery.max_retries;
    let analyzer = MockAnalyzer::new(Usd::from_dollars(0.0013)).on_item(2, ItemBehavior::Fail);
    let deps = test_deps(
        store.clone(),
        Arc::new(analyzer),
        Arc::new(MockComposer::new()),
        queue.clone(),
        config,
    );
    let worker = BatchWorker::new(deps.clone());
    let sweeper = RecoverySweeper::new(deps, Arc::new(CapturingNotifier::default()));

    let (session, records) = running_session(&store, 3, Utc::now()).await;
    let failing = records[1].id;

    let first = worker
        .run(&BatchTask {
            session_id: session.id,
            record_ids: records.iter().map(|r| r.id).collect(),
            batch_index: 0,
            retry: false,
        })
        .await
        .unwrap();
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.failed, 1);

    let mut attempts = vec![1];
    for _ in 0..10 {
        // Attempts are stamped with the wall clock; every backoff here is under ten minutes.
        let stats = sweeper.sweep(Utc::now() + Duration::minutes(10)).await.unwrap();
        let retries = batch_tasks(&queue);
        if retries.is_empty() {
            break;
        }
        assert_eq!(stats.records_reset, 1);
        for batch in retries {
            assert!(batch.retry);
            assert_eq!(batch.record_ids, vec![failing]);
            worker.run(&batch).await.unwrap();
        }

        let record = store.get_record(failing).await.unwrap().unwrap();
        assert!(record.attempt_count >= *attempts.last().unwrap());
        attempts.push(record.attempt_count);
    }

    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(attempts.iter().all(|a| *a <= max_retries + 1));

    let record = store.get_record(failing).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.attempt_count, max_retries);

    let done = store.get_session(session.id).await.unwrap().unwrap();
    assert!(!done.is_live());
    let summary = done.summary.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    // Nothing is left to retry.
    let quiet = sweeper.sweep(Utc::now() + Duration::hours(1)).await.unwrap();
    assert_eq!(quiet.records_reset, 0);
    assert!(queue.is_empty());
}

/// Drain the queue, keeping only batch tasks.
fn batch_tasks(queue: &RecordingQueue) -> Vec<BatchTask> {
    queue
        .take()
        .into_iter()
        .filter_map(|(task, _)| match task {
            Task::AnalyzeBatch(batch) => Some(batch),
            _ => None,
        })
        .collect()
}
