use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use warden_core::config::MetricSource;
use warden_core::types::MetricSample;
use warden_monitor::{MetricSampler, SamplingError};
use warden_tasks::{shell::run_shell, OpsError};

/// Reads each metric by running its configured shell command; the last
/// line of stdout must be a number.
pub struct ShellSampler {
    commands: HashMap<String, String>,
}

impl ShellSampler {
    pub fn new(sources: &[MetricSource]) -> Self {
        Self {
            commands: sources
                .iter()
                .map(|s| (s.name.clone(), s.command.clone()))
                .collect(),
        }
    }
}

fn parse_reading(stdout: &str) -> Result<f64, SamplingError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| SamplingError::Malformed("no output".into()))?;
    let value: f64 = line
        .parse()
        .map_err(|_| SamplingError::Malformed(format!("not a number: `{line}`")))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SamplingError::Malformed(format!("not a finite number: `{line}`")))
    }
}

#[async_trait]
impl MetricSampler for ShellSampler {
    async fn sample(&self, metric: &str) -> Result<MetricSample, SamplingError> {
        let command = self
            .commands
            .get(metric)
            .ok_or_else(|| SamplingError::Unavailable(format!("no command configured for {metric}")))?;
        let stdout = run_shell(command).await.map_err(|e| match e {
            OpsError::BadOutput(msg) => SamplingError::Malformed(msg),
            other => SamplingError::Unavailable(other.to_string()),
        })?;
        Ok(MetricSample::new(metric, parse_reading(&stdout)?, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> ShellSampler {
        ShellSampler::new(&[
            MetricSource {
                name: "cpu_usage".into(),
                command: "echo warming up; echo 42.5".into(),
            },
            MetricSource {
                name: "memory_usage".into(),
                command: "echo high".into(),
            },
            MetricSource {
                name: "disk_usage".into(),
                command: "echo 'db down' >&2; exit 1".into(),
            },
        ])
    }

    #[tokio::test]
    async fn reads_last_line_as_value() {
        let s = sampler().sample("cpu_usage").await.unwrap();
        assert_eq!(s.metric, "cpu_usage");
        assert_eq!(s.value, 42.5);
    }

    #[tokio::test]
    async fn non_numeric_output_is_malformed() {
        let err = sampler().sample("memory_usage").await.unwrap_err();
        assert!(matches!(err, SamplingError::Malformed(_)));
    }

    #[tokio::test]
    async fn failing_command_is_unavailable() {
        let err = sampler().sample("disk_usage").await.unwrap_err();
        match err {
            SamplingError::Unavailable(msg) => assert!(msg.contains("db down")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_metric_is_unavailable() {
        assert!(matches!(
            sampler().sample("load_avg").await,
            Err(SamplingError::Unavailable(_))
        ));
    }

    #[test]
    fn rejects_non_finite() {
        assert!(parse_reading("NaN").is_err());
        assert_eq!(parse_reading(" 7 \n").unwrap(), 7.0);
    }
}
