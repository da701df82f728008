use std::collections::HashMap;

use warden_core::types::{Alert, Comparison, MetricSample, Severity, Threshold, CONNECTIVITY_METRIC};

/// What one sample means for its metric's alert.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// At least one threshold is breached; carries the most severe one.
    Breach {
        threshold: Threshold,
        value: f64,
        message: String,
    },
    /// Nothing breached and the active alert's resolve condition holds.
    Recovered { value: f64 },
    /// Nothing breached, but the value is still inside the hysteresis band
    /// of the active alert. The alert stays open and is not re-notified.
    Holding { value: f64 },
    /// Nothing breached and no alert is open.
    Normal { value: f64 },
}

impl Verdict {
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Verdict::Breach { threshold, .. } => Some(threshold.severity),
            _ => None,
        }
    }
}

/// The severity table, grouped by metric and ordered most severe first.
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    by_metric: HashMap<String, Vec<Threshold>>,
    hysteresis_ratio: f64,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: impl IntoIterator<Item = Threshold>, hysteresis_ratio: f64) -> Self {
        let mut by_metric: HashMap<String, Vec<Threshold>> = HashMap::new();
        for t in thresholds {
            by_metric.entry(t.metric.clone()).or_default().push(t);
        }
        // Stable sort: among equal severities the configured order wins.
        for table in by_metric.values_mut() {
            table.sort_by(|a, b| b.severity.cmp(&a.severity));
        }
        Self {
            by_metric,
            hysteresis_ratio: hysteresis_ratio.max(0.0),
        }
    }

    pub fn thresholds_for(&self, metric: &str) -> &[Threshold] {
        self.by_metric.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn hysteresis_ratio(&self) -> f64 {
        self.hysteresis_ratio
    }

    /// Margin below (or above, for lower bounds) `boundary` a value must
    /// clear before an alert resolves.
    pub fn margin(&self, boundary: f64) -> f64 {
        self.hysteresis_ratio * boundary.abs()
    }

    /// Classify `sample`. `active` is the currently open alert for the
    /// sample's metric, if any; its opening threshold is the resolve reference.
    pub fn evaluate(&self, sample: &MetricSample, active: Option<&Alert>) -> Verdict {
        let value = sample.value;
        let breached = self
            .thresholds_for(&sample.metric)
            .iter()
            .find(|t| t.op.breached(value, t.boundary));

        if let Some(t) = breached {
            return Verdict::Breach {
                threshold: t.clone(),
                value,
                message: format!(
                    "{} {:.2} {} {:.2}",
                    sample.metric,
                    value,
                    t.op.symbol(),
                    t.boundary
                ),
            };
        }

        match active {
            Some(alert) if alert.op.recovered(value, alert.boundary, self.margin(alert.boundary)) => {
                Verdict::Recovered { value }
            }
            Some(_) => Verdict::Holding { value },
            None => Verdict::Normal { value },
        }
    }

    /// A metric that could not be read counts as an immediate Critical
    /// breach of the reserved connectivity metric, bypassing the table.
    pub fn sampling_failure(&self, metric: &str, reason: &str) -> Verdict {
        Verdict::Breach {
            threshold: Threshold::new(CONNECTIVITY_METRIC, Comparison::Ge, 1.0, Severity::Critical),
            value: 1.0,
            message: format!("cannot sample {metric}: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use warden_core::types::AlertState;

    fn sample(metric: &str, value: f64) -> MetricSample {
        MetricSample::new(metric, value, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
    }

    fn cpu_table() -> ThresholdEvaluator {
        ThresholdEvaluator::new(
            vec![
                Threshold::new("cpu_usage", Comparison::Ge, 80.0, Severity::High),
                Threshold::new("cpu_usage", Comparison::Ge, 95.0, Severity::Critical),
            ],
            0.10,
        )
    }

    fn open_alert(op: Comparison, boundary: f64) -> Alert {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        Alert {
            id: "x".into(),
            metric: "cpu_usage".into(),
            severity: Severity::High,
            message: String::new(),
            state: AlertState::Active,
            value: 0.0,
            op,
            boundary,
            opened_at: at,
            last_seen_at: at,
            resolved_at: None,
        }
    }

    #[test]
    fn picks_most_severe_breached_threshold() {
        let ev = cpu_table();
        assert_eq!(ev.evaluate(&sample("cpu_usage", 82.0), None).severity(), Some(Severity::High));
        assert_eq!(ev.evaluate(&sample("cpu_usage", 96.0), None).severity(), Some(Severity::Critical));
        assert_eq!(ev.evaluate(&sample("cpu_usage", 50.0), None), Verdict::Normal { value: 50.0 });
    }

    #[test]
    fn breach_message_names_boundary() {
        let Verdict::Breach { message, .. } = cpu_table().evaluate(&sample("cpu_usage", 82.0), None) else {
            panic!("expected breach");
        };
        assert_eq!(message, "cpu_usage 82.00 >= 80.00");
    }

    #[test]
    fn resolve_needs_hysteresis_margin() {
        let ev = cpu_table();
        let alert = open_alert(Comparison::Ge, 80.0);
        assert_eq!(
            ev.evaluate(&sample("cpu_usage", 79.0), Some(&alert)),
            Verdict::Holding { value: 79.0 }
        );
        assert_eq!(
            ev.evaluate(&sample("cpu_usage", 72.0), Some(&alert)),
            Verdict::Holding { value: 72.0 }
        );
        assert_eq!(
            ev.evaluate(&sample("cpu_usage", 71.0), Some(&alert)),
            Verdict::Recovered { value: 71.0 }
        );
    }

    #[test]
    fn lower_bound_thresholds_resolve_upwards() {
        let ev = ThresholdEvaluator::new(
            vec![Threshold::new("free_disk_gb", Comparison::Lt, 10.0, Severity::High)],
            0.10,
        );
        let mut alert = open_alert(Comparison::Lt, 10.0);
        alert.metric = "free_disk_gb".into();
        assert!(matches!(ev.evaluate(&sample("free_disk_gb", 9.0), None), Verdict::Breach { .. }));
        assert_eq!(
            ev.evaluate(&sample("free_disk_gb", 10.5), Some(&alert)),
            Verdict::Holding { value: 10.5 }
        );
        assert_eq!(
            ev.evaluate(&sample("free_disk_gb", 11.5), Some(&alert)),
            Verdict::Recovered { value: 11.5 }
        );
    }

    #[test]
    fn unknown_metric_is_normal() {
        assert_eq!(
            cpu_table().evaluate(&sample("load_avg", 99.0), None),
            Verdict::Normal { value: 99.0 }
        );
    }

    #[test]
    fn sampling_failure_is_critical_connectivity_breach() {
        let Verdict::Breach { threshold, message, .. } =
            cpu_table().sampling_failure("cpu_usage", "connection refused")
        else {
            panic!("expected breach");
        };
        assert_eq!(threshold.metric, CONNECTIVITY_METRIC);
        assert_eq!(threshold.severity, Severity::Critical);
        assert_eq!(message, "cannot sample cpu_usage: connection refused");
    }

    #[test]
    fn banded_table_orders_by_severity() {
        let ev = ThresholdEvaluator::new(Threshold::banded("connection_count", 100.0), 0.10);
        assert_eq!(ev.evaluate(&sample("connection_count", 101.0), None).severity(), Some(Severity::Low));
        assert_eq!(ev.evaluate(&sample("connection_count", 130.0), None).severity(), Some(Severity::Medium));
        assert_eq!(ev.evaluate(&sample("connection_count", 150.0), None).severity(), Some(Severity::High));
        assert_eq!(ev.evaluate(&sample("connection_count", 250.0), None).severity(), Some(Severity::Critical));
    }
}
