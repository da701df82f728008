use async_trait::async_trait;
use tracing::{error, info, warn};

use warden_core::types::{AlertEvent, AlertEventKind, Severity};

use crate::{channel::NotificationChannel, error::DeliveryError};

/// Writes alert events to the tracing log. Never fails.
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let alert = &event.alert;
        let summary = event.summary();
        match (event.kind, alert.severity) {
            (AlertEventKind::Resolved, _) => {
                info!(alert_id = %alert.id, metric = %alert.metric, "{summary}")
            }
            (_, Severity::Critical) => {
                error!(alert_id = %alert.id, metric = %alert.metric, value = alert.value, "{summary}")
            }
            (_, Severity::High) => {
                warn!(alert_id = %alert.id, metric = %alert.metric, value = alert.value, "{summary}")
            }
            _ => info!(alert_id = %alert.id, metric = %alert.metric, value = alert.value, "{summary}"),
        }
        Ok(())
    }
}
