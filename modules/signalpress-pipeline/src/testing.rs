// Test mocks for the pipeline.
//
// Three mocks matching the three collaborator boundaries:
// - MockAnalyzer (Analyzer): per-item behaviour, fixed cost otherwise
// - MockComposer (Composer): configurable coherence, citations and length
// - RecordingQueue (TaskQueue): captures tasks and their delays
//
// Plus fixtures for articles, deps, and pre-analyzed items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use signalpress_common::{
    AnalysisOutput, AnalysisRecord, Article, BatchRecord, BatchSession, Citation, FileConfig,
    ItemId, NewsletterKind, SignalFinding, Usd,
};
use signalpress_store::{AnalysisStore, MemoryStore, SessionStore};

use crate::deps::PipelineDeps;
use crate::generation::progress::ProgressTracker;
use crate::queue::{Task, TaskQueue};
use crate::traits::{Analysis, Analyzer, Composer, Draft, SelectedItem, Synthesis, Theme};

// ---------------------------------------------------------------------------
// MockAnalyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum ItemBehavior {
    Cost(Usd),
    Fail,
    /// Never returns; exercises the per-item timeout.
    Hang,
}

/// Analyzer that succeeds at `default_cost` unless an item is configured otherwise.
pub struct MockAnalyzer {
    default_cost: Usd,
    behaviors: HashMap<ItemId, ItemBehavior>,
    calls: AtomicUsize,
}

impl MockAnalyzer {
    pub fn new(default_cost: Usd) -> Self {
        Self {
            default_cost,
            behaviors: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on_item(mut self, item_id: ItemId, behavior: ItemBehavior) -> Self {
        self.behaviors.insert(item_id, behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self, article: &Article) -> Result<Analysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .get(&article.id)
            .copied()
            .unwrap_or(ItemBehavior::Cost(self.default_cost));
        match behavior {
            ItemBehavior::Cost(cost) => Ok(Analysis {
                output: analysis_output(article.id, 0.7),
                cost,
            }),
            ItemBehavior::Fail => bail!("analysis service returned 500 for item {}", article.id),
            ItemBehavior::Hang => std::future::pending().await,
        }
    }
}

pub fn analysis_output(item_id: ItemId, strength: f64) -> AnalysisOutput {
    AnalysisOutput {
        summary: format!("Summary of item {item_id}"),
        signal_strength: strength,
        confidence: 0.8,
        themes: vec!["housing".into()],
        signals: vec![SignalFinding {
            kind: "trend".into(),
            text: format!("Signal from item {item_id}"),
            strength,
        }],
    }
}

// ---------------------------------------------------------------------------
// MockComposer
// ---------------------------------------------------------------------------

/// Composer with fixed output shape. Cites the first `citations` selected items.
pub struct MockComposer {
    coherence: f64,
    themes: usize,
    citations: usize,
    words: usize,
    extra_citations: Vec<ItemId>,
    fail_writing: bool,
}

impl Default for MockComposer {
    fn default() -> Self {
        Self {
            coherence: 0.8,
            themes: 3,
            citations: 7,
            words: 800,
            extra_citations: Vec::new(),
            fail_writing: false,
        }
    }
}

impl MockComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coherence(mut self, coherence: f64) -> Self {
        self.coherence = coherence;
        self
    }

    pub fn citations(mut self, citations: usize) -> Self {
        self.citations = citations;
        self
    }

    pub fn words(mut self, words: usize) -> Self {
        self.words = words;
        self
    }

    /// Also cite items that were never selected.
    pub fn cite_unknown(mut self, item_ids: &[ItemId]) -> Self {
        self.extra_citations.extend_from_slice(item_ids);
        self
    }

    pub fn failing_writing(mut self) -> Self {
        self.fail_writing = true;
        self
    }
}

#[async_trait]
impl Composer for MockComposer {
    async fn synthesize(&self, items: &[SelectedItem]) -> Result<Synthesis> {
        Ok(Synthesis {
            themes: (0..self.themes)
                .map(|i| Theme {
                    title: format!("Theme {i}"),
                    summary: "A recurring pattern".into(),
                    item_ids: items.iter().map(|item| item.item_id).take(3).collect(),
                })
                .collect(),
            coherence: self.coherence,
        })
    }

    async fn write(
        &self,
        kind: NewsletterKind,
        _synthesis: &Synthesis,
        items: &[SelectedItem],
    ) -> Result<Draft> {
        if self.fail_writing {
            bail!("writer service unavailable");
        }
        let citations = items
            .iter()
            .take(self.citations)
            .map(|item| item.item_id)
            .chain(self.extra_citations.iter().copied())
            .map(|item_id| Citation {
                item_id,
                source_url: None,
                quote: None,
            })
            .collect();
        Ok(Draft {
            title: format!("The {kind} signal"),
            body: vec!["signal"; self.words].join(" "),
            citations,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingQueue
// ---------------------------------------------------------------------------

/// Captures enqueued tasks instead of running them.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<(Task, Duration)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything enqueued so far.
    pub fn take(&self) -> Vec<(Task, Duration)> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<()> {
        self.tasks.lock().unwrap().push((task, delay));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An article long enough to pass the default eligibility filter. Lower ids
/// are newer, so candidates come out in ascending id order.
pub fn article(id: ItemId) -> Article {
    Article {
        id,
        title: format!("Article {id}"),
        url: format!("https://news.example/{id}"),
        content: "lorem ipsum ".repeat(100),
        published_at: Utc::now() - ChronoDuration::minutes(id),
    }
}

pub async fn store_with_articles(n: i64) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new().with_articles((1..=n).map(article)).await)
}

pub fn test_deps(
    store: Arc<MemoryStore>,
    analyzer: Arc<dyn Analyzer>,
    composer: Arc<dyn Composer>,
    queue: Arc<RecordingQueue>,
    config: FileConfig,
) -> PipelineDeps {
    let progress = Arc::new(ProgressTracker::new(
        store.clone(),
        config.generation.weights,
    ));
    PipelineDeps::builder()
        .store(store)
        .analyzer(analyzer)
        .composer(composer)
        .queue(queue)
        .progress(progress)
        .config(Arc::new(config))
        .build()
}

/// Record completed analyses for items `1..=n` (articles must exist), as if a
/// batch session had processed them at `analyzed_at`.
pub async fn seed_analyzed(store: &MemoryStore, n: i64, analyzed_at: DateTime<Utc>) -> Result<Uuid> {
    let item_ids: Vec<ItemId> = (1..=n).collect();
    let session = BatchSession::new(Usd::from_dollars(1.0), 10, item_ids.clone(), analyzed_at);
    let records: Vec<BatchRecord> = item_ids
        .iter()
        .map(|id| BatchRecord::new(session.id, *id, analyzed_at))
        .collect();
    store.create_session(&session, &records).await?;

    for record in &records {
        store.claim_record(record.id, analyzed_at).await?;
        let strength = 0.5 + (record.item_id % 5) as f64 * 0.1;
        let (row, signals) = AnalysisRecord::from_output(
            record,
            &analysis_output(record.item_id, strength),
            Usd::from_dollars(0.0013),
            analyzed_at,
        );
        store
            .record_analysis(&row, &signals, Usd::from_dollars(0.0013), analyzed_at)
            .await?;
    }
    Ok(session.id)
}
