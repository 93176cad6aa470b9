//! Alert evaluator.
//!
//! Reads rolling aggregates over a trailing window and compares them to
//! two-tier thresholds. Quality and citation counts alert when they drop
//! below a threshold; failure rates, failed runs and spend alert above one.
//! An alert is identified by (type, window bucket) and only re-raised inside
//! its bucket when it escalates from WARNING to CRITICAL.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde_json::json;
use tracing::{info, warn};

use signalpress_common::config::AlertConfig;
use signalpress_common::{Alert, AlertSeverity, AlertType, WindowMetrics};
use signalpress_store::Store;

use crate::notify::AlertNotifier;

/// A threshold crossed by one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub observed: f64,
    pub threshold: f64,
}

fn lower_is_worse(value: f64, warning: f64, critical: f64) -> Option<(AlertSeverity, f64)> {
    if value < critical {
        Some((AlertSeverity::Critical, critical))
    } else if value < warning {
        Some((AlertSeverity::Warning, warning))
    } else {
        None
    }
}

fn higher_is_worse(value: f64, warning: f64, critical: f64) -> Option<(AlertSeverity, f64)> {
    if value > critical {
        Some((AlertSeverity::Critical, critical))
    } else if value > warning {
        Some((AlertSeverity::Warning, warning))
    } else {
        None
    }
}

fn at_least(value: f64, warning: f64, critical: f64) -> Option<(AlertSeverity, f64)> {
    if value >= critical {
        Some((AlertSeverity::Critical, critical))
    } else if value >= warning {
        Some((AlertSeverity::Warning, warning))
    } else {
        None
    }
}

/// Compare window aggregates to thresholds. Metrics without samples are skipped.
pub fn assess(metrics: &WindowMetrics, config: &AlertConfig) -> Vec<Breach> {
    let mut checks: Vec<(AlertType, f64, Option<(AlertSeverity, f64)>)> = Vec::new();

    if let Some(quality) = metrics.avg_quality_score {
        checks.push((
            AlertType::LowQualityScore,
            quality,
            lower_is_worse(quality, config.quality_warning, config.quality_critical),
        ));
    }
    if let Some(citations) = metrics.avg_citation_count {
        checks.push((
            AlertType::LowCitationCount,
            citations,
            lower_is_worse(citations, config.citation_warning, config.citation_critical),
        ));
    }

    let failure_rate = match (
        metrics.generation_failure_rate(),
        metrics.record_failure_rate(),
    ) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if let Some(rate) = failure_rate {
        checks.push((
            AlertType::HighFailureRate,
            rate,
            higher_is_worse(
                rate,
                config.failure_rate_warning,
                config.failure_rate_critical,
            ),
        ));
    }

    if metrics.runs_finished > 0 {
        let failed = metrics.runs_failed as f64;
        checks.push((
            AlertType::GenerationFailure,
            failed,
            at_least(
                failed,
                config.failed_runs_warning as f64,
                config.failed_runs_critical as f64,
            ),
        ));
    }

    if !metrics.total_spend.is_zero() {
        let spend = metrics.total_spend.dollars();
        checks.push((
            AlertType::CostThreshold,
            spend,
            higher_is_worse(spend, config.cost_warning_usd, config.cost_critical_usd),
        ));
    }

    checks
        .into_iter()
        .filter_map(|(alert_type, observed, hit)| {
            hit.map(|(severity, threshold)| Breach {
                alert_type,
                severity,
                observed,
                threshold,
            })
        })
        .collect()
}

/// Start of the bucket `now` falls in, for buckets of length `window`.
pub fn window_key(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let len = window.num_seconds().max(1);
    now.trunc_subsecs(0) - Duration::seconds(now.timestamp().rem_euclid(len))
}

/// Persist an alert unless its bucket already holds one at least as severe,
/// then forward it. Returns whether it was new.
pub async fn publish(
    store: &dyn Store,
    notifier: &dyn AlertNotifier,
    alert: &Alert,
) -> Result<bool> {
    if !store.insert_alert_if_new(alert).await? {
        return Ok(false);
    }
    warn!(
        alert_type = %alert.alert_type,
        severity = %alert.severity,
        observed = alert.observed,
        threshold = alert.threshold,
        "Alert raised"
    );
    if let Err(e) = notifier.notify(alert).await {
        warn!(error = %e, alert_type = %alert.alert_type, "Failed to send alert notification");
    }
    Ok(true)
}

pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn AlertNotifier>,
    config: AlertConfig,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn AlertNotifier>, config: AlertConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Evaluate the window ending at `now`. Returns the alerts that were new.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let window = self.config.window();
        let from = now - window;
        let metrics = self.store.window_metrics(from, now).await?;
        let key = window_key(now, window);

        let mut raised = Vec::new();
        for breach in assess(&metrics, &self.config) {
            let alert = Alert::new(
                breach.alert_type,
                breach.severity,
                from,
                now,
                key,
                breach.observed,
                breach.threshold,
                json!({
                    "window_hours": self.config.window_hours,
                    "newsletters": metrics.newsletters,
                    "runs_finished": metrics.runs_finished,
                    "records_finished": metrics.records_finished,
                }),
            );
            if publish(self.store.as_ref(), self.notifier.as_ref(), &alert).await? {
                raised.push(alert);
            }
        }

        info!(
            newsletters = metrics.newsletters,
            runs_finished = metrics.runs_finished,
            records_finished = metrics.records_finished,
            spend = %metrics.total_spend,
            raised = raised.len(),
            "Alert evaluation complete"
        );
        Ok(raised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use signalpress_common::Usd;

    fn config() -> AlertConfig {
        AlertConfig::default()
    }

    fn quality(score: f64) -> WindowMetrics {
        WindowMetrics {
            newsletters: 1,
            avg_quality_score: Some(score),
            avg_citation_count: Some(8.0),
            ..Default::default()
        }
    }

    #[test]
    fn quality_tiers() {
        let critical = assess(&quality(0.45), &config());
        assert_eq!(
            critical,
            vec![Breach {
                alert_type: AlertType::LowQualityScore,
                severity: AlertSeverity::Critical,
                observed: 0.45,
                threshold: 0.5,
            }]
        );

        let warning = assess(&quality(0.65), &config());
        assert_eq!(warning.len(), 1);
        assert_eq!(warning[0].severity, AlertSeverity::Warning);
        assert_eq!(warning[0].threshold, 0.7);

        assert!(assess(&quality(0.8), &config()).is_empty());
    }

    #[test]
    fn empty_window_raises_nothing() {
        assert!(assess(&WindowMetrics::default(), &config()).is_empty());
    }

    #[test]
    fn failure_rate_uses_the_worse_of_runs_and_records() {
        let metrics = WindowMetrics {
            runs_finished: 10,
            runs_failed: 0,
            records_finished: 100,
            records_failed: 30,
            ..Default::default()
        };
        let breaches = assess(&metrics, &config());
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].alert_type, AlertType::HighFailureRate);
        assert_eq!(breaches[0].severity, AlertSeverity::Critical);
        assert!((breaches[0].observed - 0.30).abs() < 1e-9);
    }

    #[test]
    fn failed_runs_and_spend() {
        let metrics = WindowMetrics {
            runs_finished: 40,
            runs_failed: 3,
            total_spend: Usd::from_dollars(6.0),
            ..Default::default()
        };
        let breaches = assess(&metrics, &config());
        let find = |t: AlertType| breaches.iter().find(|b| b.alert_type == t).cloned();

        assert_eq!(
            find(AlertType::GenerationFailure).map(|b| b.severity),
            Some(AlertSeverity::Critical)
        );
        assert_eq!(
            find(AlertType::CostThreshold).map(|b| b.severity),
            Some(AlertSeverity::Warning)
        );
        // 3 of 40 is under the 10% warning rate.
        assert!(find(AlertType::HighFailureRate).is_none());
    }

    #[test]
    fn window_key_truncates_to_window_length() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 17, 42, 9).unwrap();
        assert_eq!(
            window_key(at, Duration::hours(24)),
            Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()
        );
        assert_eq!(
            window_key(at, Duration::hours(1)),
            Utc.with_ymd_and_hms(2026, 10, 18, 17, 0, 0).unwrap()
        );
    }

    #[test]
    fn window_key_drops_subseconds_and_handles_pre_epoch_times() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 23, 59, 59).unwrap()
            + Duration::milliseconds(999);
        assert_eq!(
            window_key(at, Duration::hours(24)),
            Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()
        );

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 6, 30, 0).unwrap();
        assert_eq!(
            window_key(before_epoch, Duration::hours(24)),
            Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap()
        );

        // A sub-second window falls back to one-second buckets.
        assert_eq!(
            window_key(at, Duration::milliseconds(10)),
            Utc.with_ymd_and_hms(2026, 10, 18, 23, 59, 59).unwrap()
        );
    }
}
