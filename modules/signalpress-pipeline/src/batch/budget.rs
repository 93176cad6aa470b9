use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use signalpress_common::money::utilization_pct;
use signalpress_common::{BatchSession, Usd};

/// A reservation could not be granted. Control flow, not a fault: callers
/// stop scheduling work and abandon what is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("budget exceeded: requested {requested}, available {available}")]
pub struct BudgetExceeded {
    pub requested: Usd,
    pub available: Usd,
}

/// Money set aside for one in-flight call. Must be committed or released.
#[derive(Debug)]
#[must_use = "a reservation holds budget until it is committed or released"]
pub struct Reservation {
    amount: Usd,
}

impl Reservation {
    pub fn amount(&self) -> Usd {
        self.amount
    }
}

/// Spend ledger for one session.
///
/// `outstanding` is committed spend plus open reservations and never exceeds
/// the cap. Every change to it goes through a compare-and-swap, so concurrent
/// workers can never jointly overshoot.
pub struct BudgetLedger {
    cap: u64,
    outstanding: AtomicU64,
    spent: AtomicU64,
    /// Actual cost that could not be charged because the cap was reached.
    overage: AtomicU64,
}

impl BudgetLedger {
    pub fn new(cap: Usd) -> Self {
        Self::resume(cap, Usd::ZERO)
    }

    /// Rebuild a ledger from persisted spend.
    pub fn resume(cap: Usd, spent: Usd) -> Self {
        let spent = spent.micros().min(cap.micros());
        Self {
            cap: cap.micros(),
            outstanding: AtomicU64::new(spent),
            spent: AtomicU64::new(spent),
            overage: AtomicU64::new(0),
        }
    }

    pub fn reserve(&self, amount: Usd) -> Result<Reservation, BudgetExceeded> {
        let want = amount.micros();
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(want) {
                Some(next) if next <= self.cap => next,
                _ => {
                    return Err(BudgetExceeded {
                        requested: amount,
                        available: Usd::from_micros(self.cap.saturating_sub(current)),
                    })
                }
            };
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Reservation { amount }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Convert a reservation into spend. Charges the actual cost, limited to
    /// the reservation plus whatever headroom is left under the cap. Returns
    /// the amount charged.
    pub fn commit(&self, reservation: Reservation, actual: Usd) -> Usd {
        let reserved = reservation.amount.micros();
        let actual_micros = actual.micros();
        let mut current = self.outstanding.load(Ordering::Acquire);
        let charged = loop {
            let headroom = self.cap.saturating_sub(current);
            let charged = actual_micros.min(reserved.saturating_add(headroom));
            let next = current - reserved + charged;
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break charged,
                Err(observed) => current = observed,
            }
        };

        self.spent.fetch_add(charged, Ordering::AcqRel);
        if actual_micros > charged {
            let over = actual_micros - charged;
            self.overage.fetch_add(over, Ordering::AcqRel);
            warn!(
                actual = %actual,
                charged = %Usd::from_micros(charged),
                "Call cost exceeded the remaining budget; overage recorded"
            );
        }
        Usd::from_micros(charged)
    }

    /// Return a reservation unused.
    pub fn release(&self, reservation: Reservation) {
        self.outstanding
            .fetch_sub(reservation.amount.micros(), Ordering::AcqRel);
    }

    pub fn cap(&self) -> Usd {
        Usd::from_micros(self.cap)
    }

    pub fn spent(&self) -> Usd {
        Usd::from_micros(self.spent.load(Ordering::Acquire))
    }

    pub fn overage(&self) -> Usd {
        Usd::from_micros(self.overage.load(Ordering::Acquire))
    }

    /// Budget not yet spent or reserved.
    pub fn remaining(&self) -> Usd {
        Usd::from_micros(
            self.cap
                .saturating_sub(self.outstanding.load(Ordering::Acquire)),
        )
    }

    pub fn utilization_pct(&self) -> f64 {
        utilization_pct(self.spent(), self.cap())
    }

    pub fn log_status(&self, session_id: Uuid) {
        info!(
            %session_id,
            spent = %self.spent(),
            remaining = %self.remaining(),
            cap = %self.cap(),
            utilization_pct = self.utilization_pct(),
            "Budget status"
        );
    }
}

/// One ledger per live session, created on first use from the session's
/// persisted spend.
#[derive(Default)]
pub struct LedgerRegistry {
    ledgers: Mutex<HashMap<Uuid, Arc<BudgetLedger>>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ledger_for(&self, session: &BatchSession) -> Arc<BudgetLedger> {
        let mut ledgers = self.ledgers.lock().await;
        ledgers
            .entry(session.id)
            .or_insert_with(|| {
                Arc::new(BudgetLedger::resume(session.budget_cap, session.budget_spent))
            })
            .clone()
    }

    pub async fn remove(&self, session_id: Uuid) {
        self.ledgers.lock().await.remove(&session_id);
    }

    pub async fn len(&self) -> usize {
        self.ledgers.lock().await.len()
    }
}
