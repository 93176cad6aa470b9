// Collaborator boundaries for the pipeline.
//
// Analyzer: one article in, a typed analysis plus what it cost out.
// Composer: the two AI-backed generation steps (synthesis, writing).
//
// Both are opaque. Production uses the HTTP adapters in `http`; tests use the
// mocks in `testing`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use signalpress_common::{AnalysisOutput, AnalyzedItem, Article, Citation, NewsletterKind, Usd};

/// An analyzed item chosen by the selection step.
pub type SelectedItem = AnalyzedItem;

/// Result of one analysis call.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub output: AnalysisOutput,
    /// What the call actually cost. May differ from the reserved estimate.
    pub cost: Usd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub item_ids: Vec<i64>,
}

/// Cross-item themes found by the synthesis step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub themes: Vec<Theme>,
    /// How well the themes hang together (0.0-1.0).
    pub coherence: f64,
}

/// Newsletter text produced by the writing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, article: &Article) -> Result<Analysis>;
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Composer: Send + Sync {
    async fn synthesize(&self, items: &[SelectedItem]) -> Result<Synthesis>;

    async fn write(
        &self,
        kind: NewsletterKind,
        synthesis: &Synthesis,
        items: &[SelectedItem],
    ) -> Result<Draft>;
}
