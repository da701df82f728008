use async_trait::async_trait;

use warden_core::types::AlertEvent;

use crate::error::DeliveryError;

/// Common interface implemented by every notification channel (log, webhook, …).
///
/// Implementations must be `Send + Sync`: each channel is driven by its own
/// dispatcher worker task and shared behind an `Arc`.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable lowercase identifier, used in log fields and lane statistics.
    fn name(&self) -> &str;

    /// Deliver one alert event. One call is one attempt; retrying is the
    /// dispatcher's job.
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError>;
}
