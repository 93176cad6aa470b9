use async_trait::async_trait;

use signalpress_common::Alert;

/// Pluggable destination for newly raised alerts.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}
