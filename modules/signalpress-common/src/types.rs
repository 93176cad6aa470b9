use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::{utilization_pct, Usd};
use crate::quality::QualityMetrics;

/// Identifier of a source article as assigned by the ingestion side.
pub type ItemId = i64;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using
/// the lowercase snake_case names stored in the database.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{other}'", stringify!($ty))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Articles and analysis output
// ---------------------------------------------------------------------------

/// A source article, supplied by the ingestion side. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ItemId,
    pub title: String,
    pub url: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
}

/// One signal the analyzer found inside an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFinding {
    pub kind: String,
    pub text: String,
    pub strength: f64,
}

/// Typed result of analyzing a single article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub summary: String,
    pub signal_strength: f64,
    pub confidence: f64,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub signals: Vec<SignalFinding>,
}

/// Comprehensive per-item analysis row. One per item; a re-analysis replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub item_id: ItemId,
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub summary: String,
    pub signal_strength: f64,
    pub confidence: f64,
    pub themes: Vec<String>,
    pub cost: Usd,
    pub analyzed_at: DateTime<Utc>,
}

/// Granular per-signal row, fanned out from the same write as its `AnalysisRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: Uuid,
    pub item_id: ItemId,
    pub kind: String,
    pub text: String,
    pub strength: f64,
}

impl AnalysisRecord {
    /// Split an analyzer output into the comprehensive row and its signal rows.
    pub fn from_output(
        record: &BatchRecord,
        output: &AnalysisOutput,
        cost: Usd,
        analyzed_at: DateTime<Utc>,
    ) -> (AnalysisRecord, Vec<SignalRow>) {
        let analysis = AnalysisRecord {
            item_id: record.item_id,
            record_id: record.id,
            session_id: record.session_id,
            summary: output.summary.clone(),
            signal_strength: output.signal_strength.clamp(0.0, 1.0),
            confidence: output.confidence.clamp(0.0, 1.0),
            themes: output.themes.clone(),
            cost,
            analyzed_at,
        };
        let signals = output
            .signals
            .iter()
            .map(|s| SignalRow {
                id: Uuid::new_v4(),
                item_id: record.item_id,
                kind: s.kind.clone(),
                text: s.text.clone(),
                strength: s.strength.clamp(0.0, 1.0),
            })
            .collect();
        (analysis, signals)
    }
}

/// An analyzed article joined with its source metadata; the unit the
/// generation pipeline selects from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedItem {
    pub item_id: ItemId,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub signal_strength: f64,
    pub confidence: f64,
    pub themes: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Batch sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Running,
    PartiallyComplete,
    Completed,
    Failed,
    Stalled,
}

string_enum!(SessionStatus {
    Pending => "pending",
    Running => "running",
    PartiallyComplete => "partially_complete",
    Completed => "completed",
    Failed => "failed",
    Stalled => "stalled",
});

impl SessionStatus {
    /// Position in the monotone status order. Transitions only move to a strictly higher rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Stalled => 2,
            Self::PartiallyComplete | Self::Completed | Self::Failed => 3,
        }
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }
}

/// Aggregated outcome written once when a session is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_items: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub abandoned: u32,
    pub total_spent: Usd,
    pub budget_utilization_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSession {
    pub id: Uuid,
    pub status: SessionStatus,
    pub budget_cap: Usd,
    pub budget_spent: Usd,
    pub batch_size: u32,
    pub item_ids: Vec<ItemId>,
    /// Set when scheduling stopped early because the budget could not cover more work.
    pub truncated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub summary: Option<SessionSummary>,
}

impl BatchSession {
    pub fn new(budget_cap: Usd, batch_size: u32, item_ids: Vec<ItemId>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            budget_cap,
            budget_spent: Usd::ZERO,
            batch_size,
            item_ids,
            truncated: false,
            created_at: now,
            updated_at: now,
            finalized_at: None,
            summary: None,
        }
    }

    /// Live sessions are still watched by the recovery sweep.
    pub fn is_live(&self) -> bool {
        self.finalized_at.is_none()
    }

    /// Apply a status change if it moves forward. Returns whether it was applied.
    pub fn transition(&mut self, next: SessionStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    pub fn utilization_pct(&self) -> f64 {
        utilization_pct(self.budget_spent, self.budget_cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Abandoned,
}

string_enum!(RecordStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Succeeded => "succeeded",
    Failed => "failed",
    Abandoned => "abandoned",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub item_id: ItemId,
    pub attempt_count: u32,
    pub status: RecordStatus,
    pub cost: Usd,
    pub last_error: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(session_id: Uuid, item_id: ItemId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            item_id,
            attempt_count: 0,
            status: RecordStatus::Pending,
            cost: Usd::ZERO,
            last_error: None,
            last_attempted_at: None,
            updated_at: now,
        }
    }

    /// Whether a retry may still be granted for a failed record.
    pub fn retries_remaining(&self, max_retries: u32) -> bool {
        self.attempt_count < max_retries
    }

    /// A settled record will never change again without operator action.
    pub fn is_settled(&self, max_retries: u32) -> bool {
        match self.status {
            RecordStatus::Succeeded | RecordStatus::Abandoned => true,
            RecordStatus::Failed => !self.retries_remaining(max_retries),
            RecordStatus::Pending | RecordStatus::InProgress => false,
        }
    }

    /// Earliest instant a failed record may be retried: `base_delay × 2^attempt_count`
    /// after its last attempt.
    pub fn retry_due_at(&self, base_delay: Duration) -> Option<DateTime<Utc>> {
        let last = self.last_attempted_at?;
        let factor = 2_i32.saturating_pow(self.attempt_count.min(20));
        Some(last + base_delay * factor)
    }
}

/// Live record counts for a session, by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub abandoned: u32,
}

impl RecordCounts {
    pub fn tally(records: &[BatchRecord]) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::InProgress => counts.in_progress += 1,
                RecordStatus::Succeeded => counts.succeeded += 1,
                RecordStatus::Failed => counts.failed += 1,
                RecordStatus::Abandoned => counts.abandoned += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.succeeded + self.failed + self.abandoned
    }
}

// ---------------------------------------------------------------------------
// Generation runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsletterKind {
    Daily,
    Weekly,
}

string_enum!(NewsletterKind {
    Daily => "daily",
    Weekly => "weekly",
});

impl NewsletterKind {
    /// How far back the selection step looks for analyzed items.
    pub fn lookback(self) -> Duration {
        match self {
            Self::Daily => Duration::hours(24),
            Self::Weekly => Duration::days(7),
        }
    }

    /// Identifies the publication period a run belongs to, e.g. `2026-10-18` or `2026-W42`.
    pub fn period_key(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Weekly => {
                let week = now.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStep {
    Selection,
    Synthesis,
    Writing,
    Storage,
}

string_enum!(GenerationStep {
    Selection => "selection",
    Synthesis => "synthesis",
    Writing => "writing",
    Storage => "storage",
});

impl GenerationStep {
    pub const ALL: [GenerationStep; 4] = [
        GenerationStep::Selection,
        GenerationStep::Synthesis,
        GenerationStep::Writing,
        GenerationStep::Storage,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Selection => 0,
            Self::Synthesis => 1,
            Self::Writing => 2,
            Self::Storage => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    InProgress,
    Complete,
    Failed,
}

string_enum!(GenerationStatus {
    InProgress => "in_progress",
    Complete => "complete",
    Failed => "failed",
});

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Durable, pollable state of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub task_id: Uuid,
    pub kind: NewsletterKind,
    pub current_step: GenerationStep,
    pub step_progress: f64,
    pub overall_progress: f64,
    /// Free-form metrics from the executing step. Always a JSON object.
    pub step_details: serde_json::Value,
    /// Preview payload per step, keyed by step name.
    pub intermediate_results: BTreeMap<String, serde_json::Value>,
    pub quality_metrics: QualityMetrics,
    /// Reasons a quality gate degraded (but did not fail) this run.
    pub degradations: Vec<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub status: GenerationStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub newsletter_id: Option<Uuid>,
}

impl GenerationProgress {
    pub fn new(task_id: Uuid, kind: NewsletterKind, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            kind,
            current_step: GenerationStep::Selection,
            step_progress: 0.0,
            overall_progress: 0.0,
            step_details: serde_json::Value::Object(Default::default()),
            intermediate_results: BTreeMap::new(),
            quality_metrics: QualityMetrics::default(),
            degradations: Vec::new(),
            estimated_completion: None,
            status: GenerationStatus::InProgress,
            started_at: now,
            updated_at: now,
            newsletter_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The failure reason, if the run failed.
    pub fn failure_reason(&self) -> Option<&str> {
        self.step_details.get("failure_reason")?.as_str()
    }
}

/// A source reference inside a written newsletter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub item_id: ItemId,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
}

/// The stored artifact of a successful generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Newsletter {
    pub id: Uuid,
    pub kind: NewsletterKind,
    pub period_key: String,
    pub title: String,
    pub body: String,
    pub citations: Vec<Citation>,
    pub quality_metrics: QualityMetrics,
    pub degradations: Vec<String>,
    pub task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    GenerationFailure,
    LowQualityScore,
    LowCitationCount,
    HighFailureRate,
    StuckGeneration,
    CostThreshold,
}

string_enum!(AlertType {
    GenerationFailure => "generation_failure",
    LowQualityScore => "low_quality_score",
    LowCitationCount => "low_citation_count",
    HighFailureRate => "high_failure_rate",
    StuckGeneration => "stuck_generation",
    CostThreshold => "cost_threshold",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

string_enum!(AlertSeverity {
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Dedup bucket: alerts with the same type and key are the same alert.
    pub window_key: DateTime<Utc>,
    pub observed: f64,
    pub threshold: f64,
    pub context: serde_json::Value,
}

impl Alert {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        window_key: DateTime<Utc>,
        observed: f64,
        threshold: f64,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            generated_at: Utc::now(),
            window_start,
            window_end,
            window_key,
            observed,
            threshold,
            context,
        }
    }
}

/// Rolling aggregates over a trailing window, as read by the alert evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub newsletters: u32,
    pub avg_quality_score: Option<f64>,
    pub avg_citation_count: Option<f64>,
    pub runs_finished: u32,
    pub runs_failed: u32,
    pub records_finished: u32,
    pub records_failed: u32,
    pub total_spend: Usd,
}

impl WindowMetrics {
    pub fn generation_failure_rate(&self) -> Option<f64> {
        (self.runs_finished > 0).then(|| self.runs_failed as f64 / self.runs_finished as f64)
    }

    pub fn record_failure_rate(&self) -> Option<f64> {
        (self.records_finished > 0)
            .then(|| self.records_failed as f64 / self.records_finished as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_status_never_regresses() {
        let now = Utc::now();
        let mut session = BatchSession::new(Usd::from_dollars(1.0), 10, vec![1, 2], now);
        assert!(session.transition(SessionStatus::Running, now));
        assert!(!session.transition(SessionStatus::Pending, now));
        assert!(session.transition(SessionStatus::Stalled, now));
        assert!(!session.transition(SessionStatus::Running, now));
        assert!(session.transition(SessionStatus::Completed, now));
        assert!(!session.transition(SessionStatus::Failed, now));
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn failed_record_with_retries_left_is_not_settled() {
        let mut record = BatchRecord::new(Uuid::new_v4(), 7, Utc::now());
        record.status = RecordStatus::Failed;
        record.attempt_count = 1;
        assert!(!record.is_settled(3));
        record.attempt_count = 3;
        assert!(record.is_settled(3));
    }

    #[test]
    fn retry_backoff_doubles_per_attempt() {
        let last = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let mut record = BatchRecord::new(Uuid::new_v4(), 1, last);
        record.last_attempted_at = Some(last);
        record.attempt_count = 1;
        assert_eq!(
            record.retry_due_at(Duration::seconds(60)),
            Some(last + Duration::seconds(120))
        );
        record.attempt_count = 3;
        assert_eq!(
            record.retry_due_at(Duration::seconds(60)),
            Some(last + Duration::seconds(480))
        );
    }

    #[test]
    fn weekly_period_key_uses_iso_week() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        assert_eq!(NewsletterKind::Daily.period_key(now), "2026-10-18");
        assert_eq!(NewsletterKind::Weekly.period_key(now), "2026-W42");
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::PartiallyComplete,
            SessionStatus::Stalled,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>(), Ok(status));
        }
        assert!("bogus".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn progress_serializes_screaming_enums() {
        let progress = GenerationProgress::new(Uuid::new_v4(), NewsletterKind::Daily, Utc::now());
        let v = serde_json::to_value(&progress).unwrap();
        assert_eq!(v["current_step"], "SELECTION");
        assert_eq!(v["status"], "IN_PROGRESS");
        assert_eq!(v["kind"], "daily");
    }
}
