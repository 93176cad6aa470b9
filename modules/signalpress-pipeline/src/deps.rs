use std::sync::Arc;

use typed_builder::TypedBuilder;

use signalpress_common::FileConfig;
use signalpress_store::Store;

use crate::batch::budget::LedgerRegistry;
use crate::generation::progress::ProgressTracker;
use crate::queue::TaskQueue;
use crate::traits::{Analyzer, Composer};

/// Shared dependency container for batch and generation work.
///
/// Holds long-lived, cloneable handles. Everything a worker or a handler needs
/// is passed through here; nothing is global.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub store: Arc<dyn Store>,
    pub analyzer: Arc<dyn Analyzer>,
    pub composer: Arc<dyn Composer>,
    pub queue: Arc<dyn TaskQueue>,
    pub progress: Arc<ProgressTracker>,
    #[builder(default)]
    pub ledgers: Arc<LedgerRegistry>,
    #[builder(default)]
    pub config: Arc<FileConfig>,
}
