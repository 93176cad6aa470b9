//! Batch analysis and newsletter generation.
//!
//! `batch` turns eligible articles into budget-capped sessions of analysis
//! work; `generation` runs the four-step newsletter pipeline with progress
//! tracking and quality gates. Both are driven by tasks on a [`queue::TaskQueue`].

pub mod batch;
pub mod deps;
pub mod executor;
pub mod generation;
pub mod http;
pub mod queue;
pub mod traits;

#[cfg(feature = "test-support")]
pub mod testing;

pub use deps::PipelineDeps;
pub use executor::PipelineExecutor;
pub use queue::{BatchTask, GenerationTask, LocalQueue, Task, TaskExecutor, TaskQueue};
pub use traits::{Analysis, Analyzer, Composer, Draft, SelectedItem, Synthesis, Theme};
