use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::alerts::AlertEvaluator;
use crate::recovery::RecoverySweeper;

/// Drives the recovery sweep and the alert evaluator on their own intervals
/// until shutdown is signalled.
pub struct Supervisor {
    recovery: Arc<RecoverySweeper>,
    alerts: Arc<AlertEvaluator>,
    recovery_interval: Duration,
    alert_interval: Duration,
}

impl Supervisor {
    pub fn new(
        recovery: Arc<RecoverySweeper>,
        alerts: Arc<AlertEvaluator>,
        recovery_interval: Duration,
        alert_interval: Duration,
    ) -> Self {
        Self {
            recovery,
            alerts,
            recovery_interval,
            alert_interval,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut recovery_tick = tokio::time::interval(self.recovery_interval);
            recovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut alert_tick = tokio::time::interval(self.alert_interval);
            alert_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                recovery_secs = self.recovery_interval.as_secs(),
                alert_secs = self.alert_interval.as_secs(),
                "Supervisor started"
            );

            loop {
                tokio::select! {
                    _ = recovery_tick.tick() => {
                        if let Err(e) = self.recovery.sweep(Utc::now()).await {
                            warn!(error = %e, "Recovery sweep failed");
                        }
                    }
                    _ = alert_tick.tick() => {
                        if let Err(e) = self.alerts.evaluate(Utc::now()).await {
                            warn!(error = %e, "Alert evaluation failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Supervisor stopped");
        })
    }
}
