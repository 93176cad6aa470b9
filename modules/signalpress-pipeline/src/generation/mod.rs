pub mod progress;
pub mod quality_gate;
pub mod runner;

pub use progress::{ProgressError, ProgressTracker, UpdateOutcome};
pub use quality_gate::{GateVerdict, QualityGate, WritingCheck};
pub use runner::{GenerateError, GenerationRunner, Submitted};
