//! Persistence for sessions, records, analyses, progress, newsletters and alerts.
//!
//! Everything the pipeline touches goes through the traits in [`traits`].
//! `MemoryStore` backs tests and single-process deployments; `PgStore` is the
//! production Postgres implementation.

pub mod memory;
pub mod postgres;
pub mod traits;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{
    AlertStore, AnalysisStore, ArticleStore, MetricsStore, NewsletterStore, ProgressStore,
    SessionStore, Store,
};
