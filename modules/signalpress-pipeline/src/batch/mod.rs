pub mod budget;
pub mod eligibility;
pub mod orchestrator;
pub mod worker;

pub use budget::{BudgetExceeded, BudgetLedger, LedgerRegistry, Reservation};
pub use orchestrator::{BatchOrchestrator, InitiateBatch, InitiateError, SessionView};
pub use worker::{BatchOutcome, BatchWorker};
