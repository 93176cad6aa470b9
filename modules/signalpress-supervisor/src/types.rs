use std::fmt;

use serde::Serialize;

/// What one recovery sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub sessions_checked: u32,
    pub records_reset: u32,
    pub attempts_failed: u32,
    pub sessions_stalled: u32,
    pub sessions_finalized: u32,
    pub runs_failed: u32,
    pub progress_purged: u64,
}

impl RecoveryStats {
    pub fn is_quiet(&self) -> bool {
        self.records_reset == 0
            && self.attempts_failed == 0
            && self.sessions_stalled == 0
            && self.sessions_finalized == 0
            && self.runs_failed == 0
            && self.progress_purged == 0
    }
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked={} reset={} stalled_attempts={} stalled_sessions={} finalized={} failed_runs={} purged={}",
            self.sessions_checked,
            self.records_reset,
            self.attempts_failed,
            self.sessions_stalled,
            self.sessions_finalized,
            self.runs_failed,
            self.progress_purged,
        )
    }
}
