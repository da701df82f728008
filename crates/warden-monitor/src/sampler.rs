use async_trait::async_trait;

use warden_core::types::MetricSample;

use crate::error::SamplingError;

/// Produces timestamped metric values. Called once per monitoring tick for
/// every configured metric.
#[async_trait]
pub trait MetricSampler: Send + Sync {
    async fn sample(&self, metric: &str) -> Result<MetricSample, SamplingError>;
}
