use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use signalpress_common::{Alert, AlertSeverity};

use super::backend::AlertNotifier;

/// Slack incoming webhook.
pub struct SlackWebhook {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackWebhook {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    fn severity_emoji(severity: AlertSeverity) -> &'static str {
        match severity {
            AlertSeverity::Warning => ":warning:",
            AlertSeverity::Critical => ":rotating_light:",
        }
    }

    fn render(alert: &Alert) -> String {
        format!(
            "{} *signalpress {}*: `{}`\n*Observed:* {:.3} (threshold {:.3})\n*Window:* {} to {}",
            Self::severity_emoji(alert.severity),
            alert.severity,
            alert.alert_type,
            alert.observed,
            alert.threshold,
            alert.window_start.format("%Y-%m-%d %H:%M"),
            alert.window_end.format("%Y-%m-%d %H:%M"),
        )
    }
}

#[async_trait]
impl AlertNotifier for SlackWebhook {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        let payload = json!({
            "text": Self::render(alert),
            "unfurl_links": false,
        });

        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned non-success");
            anyhow::bail!("Slack webhook returned {status}");
        }

        Ok(())
    }
}
