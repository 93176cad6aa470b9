//! Background supervision: the recovery sweep that retries, stalls and
//! finalizes batch work, and the alert evaluator that watches quality, failure
//! rate and spend over a trailing window.

pub mod alerts;
pub mod notify;
pub mod recovery;
pub mod supervisor;
pub mod types;

pub use alerts::AlertEvaluator;
pub use recovery::RecoverySweeper;
pub use supervisor::Supervisor;
pub use types::RecoveryStats;
