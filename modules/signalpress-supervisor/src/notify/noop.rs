use async_trait::async_trait;

use signalpress_common::Alert;

use super::backend::AlertNotifier;

/// Drops every alert. Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl AlertNotifier for NoopNotifier {
    async fn notify(&self, _alert: &Alert) -> anyhow::Result<()> {
        Ok(())
    }
}
