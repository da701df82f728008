use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved metric name for the synthetic alert raised when a metric cannot be sampled.
pub const CONNECTIVITY_METRIC: &str = "connectivity";

/// Defines when a recurring task is due. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Repeat every N seconds, independent of wall-clock alignment.
    Interval { every_secs: u64 },

    /// Fire at HH:MM every day.
    Daily { hour: u8, minute: u8 },

    /// Fire at HH:MM on a specific weekday (`"mon"`, `"tuesday"`, ...).
    Weekly { day: Weekday, hour: u8, minute: u8 },

    /// Fire at HH:MM on a day of the month (1-31), clamped to short months.
    Monthly { day: u8, hour: u8, minute: u8 },
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval { every_secs } => write!(f, "every {every_secs}s"),
            ScheduleSpec::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            ScheduleSpec::Weekly { day, hour, minute } => {
                write!(f, "weekly on {day} at {hour:02}:{minute:02}")
            }
            ScheduleSpec::Monthly { day, hour, minute } => {
                write!(f, "monthly on day {day} at {hour:02}:{minute:02}")
            }
        }
    }
}

/// The closed set of automated work the daemon knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    HealthReport,
    PerformanceReport,
    Optimize,
    Cleanup,
    ConnectionCheck,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Backup => "backup",
            TaskKind::HealthReport => "health_report",
            TaskKind::PerformanceReport => "performance_report",
            TaskKind::Optimize => "optimize",
            TaskKind::Cleanup => "cleanup",
            TaskKind::ConnectionCheck => "connection_check",
        };
        write!(f, "{s}")
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// How a sampled value is compared against a threshold boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
}

impl Comparison {
    /// True when `value` is on the alerting side of `boundary`.
    pub fn breached(self, value: f64, boundary: f64) -> bool {
        match self {
            Comparison::Gt => value > boundary,
            Comparison::Ge => value >= boundary,
            Comparison::Lt => value < boundary,
            Comparison::Le => value <= boundary,
        }
    }

    /// True when `value` has moved back past `boundary` by at least `margin`.
    ///
    /// For upper bounds (`Gt`/`Ge`) the value must fall below `boundary - margin`;
    /// for lower bounds it must rise above `boundary + margin`.
    pub fn recovered(self, value: f64, boundary: f64, margin: f64) -> bool {
        match self {
            Comparison::Gt | Comparison::Ge => value < boundary - margin,
            Comparison::Lt | Comparison::Le => value > boundary + margin,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }
}

impl std::str::FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gt" | ">" => Ok(Comparison::Gt),
            "ge" | ">=" => Ok(Comparison::Ge),
            "lt" | "<" => Ok(Comparison::Lt),
            "le" | "<=" => Ok(Comparison::Le),
            other => Err(format!("unknown comparison: {other}")),
        }
    }
}

/// One row of the severity table: `metric op boundary` means `severity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub op: Comparison,
    pub boundary: f64,
    pub severity: Severity,
}

impl Threshold {
    pub fn new(metric: impl Into<String>, op: Comparison, boundary: f64, severity: Severity) -> Self {
        Self {
            metric: metric.into(),
            op,
            boundary,
            severity,
        }
    }

    /// Four-band table over a base limit: Low above it, Medium at 1.2x,
    /// High at 1.5x, Critical at 2x.
    pub fn banded(metric: &str, base: f64) -> Vec<Threshold> {
        vec![
            Threshold::new(metric, Comparison::Gt, base, Severity::Low),
            Threshold::new(metric, Comparison::Ge, base * 1.2, Severity::Medium),
            Threshold::new(metric, Comparison::Ge, base * 1.5, Severity::High),
            Threshold::new(metric, Comparison::Ge, base * 2.0, Severity::Critical),
        ]
    }
}

/// A single timestamped reading produced by a metric sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub at: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, value: f64, at: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            value,
            at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Resolved,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertState::Active => "active",
            AlertState::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertState::Active),
            "resolved" => Ok(AlertState::Resolved),
            other => Err(format!("unknown alert state: {other}")),
        }
    }
}

/// A threshold breach and its lifecycle. Alerts are never deleted by the
/// monitor; resolved ones stay for history until purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// `{metric}:{opening severity}:{opened_at unix secs}`.
    pub id: String,
    pub metric: String,
    pub severity: Severity,
    pub message: String,
    pub state: AlertState,
    /// Most recent value seen while the alert was open (or the resolving value).
    pub value: f64,
    /// Comparison of the threshold that opened the alert.
    pub op: Comparison,
    /// Boundary of the threshold that opened the alert; the resolve reference.
    pub boundary: f64,
    pub opened_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.state == AlertState::Active
    }
}

/// Which lifecycle transition an [`AlertEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventKind {
    Opened,
    Escalated,
    Resolved,
}

impl fmt::Display for AlertEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertEventKind::Opened => "opened",
            AlertEventKind::Escalated => "escalated",
            AlertEventKind::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

/// An alert state change pushed to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    /// Snapshot of the alert after the transition.
    pub alert: Alert,
    /// Set on escalation.
    pub previous_severity: Option<Severity>,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    /// One-line human summary, used as a subject line by channels.
    pub fn summary(&self) -> String {
        match self.kind {
            AlertEventKind::Opened => format!(
                "[{}] {} alert opened: {}",
                self.alert.severity, self.alert.metric, self.alert.message
            ),
            AlertEventKind::Escalated => format!(
                "[{}] {} alert escalated from {}: {}",
                self.alert.severity,
                self.alert.metric,
                self.previous_severity
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                self.alert.message
            ),
            AlertEventKind::Resolved => format!(
                "[{}] {} alert resolved at {:.2}",
                self.alert.severity, self.alert.metric, self.alert.value
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            [Severity::High, Severity::Low, Severity::Critical].iter().max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn upper_bound_recovers_only_past_margin() {
        let op = Comparison::Ge;
        assert!(op.breached(80.0, 80.0));
        assert!(!op.recovered(75.0, 80.0, 8.0));
        assert!(op.recovered(71.0, 80.0, 8.0));
    }

    #[test]
    fn lower_bound_recovers_upwards() {
        let op = Comparison::Lt;
        assert!(op.breached(5.0, 10.0));
        assert!(!op.recovered(10.5, 10.0, 1.0));
        assert!(op.recovered(11.5, 10.0, 1.0));
    }

    #[test]
    fn banded_thresholds_follow_ratios() {
        let bands = Threshold::banded("connection_count", 100.0);
        let boundaries: Vec<f64> = bands.iter().map(|t| t.boundary).collect();
        assert_eq!(boundaries, vec![100.0, 120.0, 150.0, 200.0]);
        assert_eq!(bands[3].severity, Severity::Critical);
    }

    #[test]
    fn schedule_spec_deserializes_tagged_tables() {
        let spec: ScheduleSpec =
            serde_json::from_str(r#"{"kind":"weekly","day":"monday","hour":8,"minute":0}"#)
                .unwrap();
        assert_eq!(
            spec,
            ScheduleSpec::Weekly {
                day: Weekday::Mon,
                hour: 8,
                minute: 0
            }
        );
    }

    #[test]
    fn comparison_accepts_symbol_aliases() {
        let op: Comparison = serde_json::from_str(r#"">=""#).unwrap();
        assert_eq!(op, Comparison::Ge);
        assert_eq!("<".parse::<Comparison>().unwrap(), Comparison::Lt);
    }
}
