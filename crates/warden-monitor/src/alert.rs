use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use warden_core::types::{Alert, AlertEvent, AlertEventKind, AlertState, Severity};

use crate::{
    error::{MonitorError, Result},
    threshold::Verdict,
};

/// Counts of active alerts, for status output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total_active: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub oldest_opened_at: Option<DateTime<Utc>>,
    pub newest_opened_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    alerts: HashMap<String, Alert>,
    /// metric -> id of its single Active alert.
    active: HashMap<String, String>,
    /// Alerts changed since the last [`AlertStore::take_dirty`].
    dirty: HashSet<String>,
}

/// Sole owner of alert records.
///
/// Applies verdicts to the alert lifecycle and reports each transition
/// (opened, escalated, resolved) as an [`AlertEvent`]. A repeated breach at
/// the same or lower severity only refreshes `last_seen_at` and yields no
/// event.
#[derive(Default)]
pub struct AlertStore {
    inner: RwLock<Inner>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one verdict for `metric` and return the transition it caused, if any.
    pub fn record_evaluation(
        &self,
        metric: &str,
        verdict: &Verdict,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let mut inner = self.inner.write().expect("alert store poisoned");
        let active_id = inner.active.get(metric).cloned();

        match (verdict, active_id) {
            (
                Verdict::Breach {
                    threshold,
                    value,
                    message,
                },
                None,
            ) => {
                let id = inner.unique_id(metric, threshold.severity, now);
                let alert = Alert {
                    id: id.clone(),
                    metric: metric.to_string(),
                    severity: threshold.severity,
                    message: message.clone(),
                    state: AlertState::Active,
                    value: *value,
                    op: threshold.op,
                    boundary: threshold.boundary,
                    opened_at: now,
                    last_seen_at: now,
                    resolved_at: None,
                };
                warn!(alert_id = %id, metric = %metric, severity = %alert.severity, value, "alert opened");
                inner.active.insert(metric.to_string(), id.clone());
                inner.alerts.insert(id.clone(), alert.clone());
                inner.dirty.insert(id);
                Some(AlertEvent {
                    kind: AlertEventKind::Opened,
                    alert,
                    previous_severity: None,
                    at: now,
                })
            }

            (
                Verdict::Breach {
                    threshold,
                    value,
                    message,
                },
                Some(id),
            ) => {
                inner.dirty.insert(id.clone());
                let alert = inner.alerts.get_mut(&id)?;
                alert.last_seen_at = now;
                alert.value = *value;
                if threshold.severity <= alert.severity {
                    return None;
                }
                // Escalation keeps the opening boundary as the resolve reference.
                let previous = alert.severity;
                alert.severity = threshold.severity;
                alert.message = message.clone();
                warn!(
                    alert_id = %id,
                    metric = %metric,
                    from = %previous,
                    to = %alert.severity,
                    value,
                    "alert escalated"
                );
                Some(AlertEvent {
                    kind: AlertEventKind::Escalated,
                    alert: alert.clone(),
                    previous_severity: Some(previous),
                    at: now,
                })
            }

            (Verdict::Recovered { value }, Some(id)) => {
                let event = inner.resolve_locked(&id, Some(*value), now);
                if event.is_some() {
                    info!(alert_id = %id, metric = %metric, value, "alert resolved");
                }
                event
            }

            (Verdict::Holding { value }, Some(id)) => {
                inner.dirty.insert(id.clone());
                let alert = inner.alerts.get_mut(&id)?;
                alert.last_seen_at = now;
                alert.value = *value;
                None
            }

            _ => None,
        }
    }

    /// Resolve an active alert by hand.
    pub fn resolve(&self, id: &str, now: DateTime<Utc>) -> Result<AlertEvent> {
        let mut inner = self.inner.write().expect("alert store poisoned");
        match inner.alerts.get(id) {
            None => return Err(MonitorError::AlertNotFound { id: id.to_string() }),
            Some(a) if !a.is_active() => {
                return Err(MonitorError::AlertNotActive { id: id.to_string() })
            }
            Some(_) => {}
        }
        let event = inner
            .resolve_locked(id, None, now)
            .ok_or_else(|| MonitorError::AlertNotFound { id: id.to_string() })?;
        info!(alert_id = %id, "alert resolved manually");
        Ok(event)
    }

    pub fn active_for(&self, metric: &str) -> Option<Alert> {
        let inner = self.inner.read().expect("alert store poisoned");
        inner
            .active
            .get(metric)
            .and_then(|id| inner.alerts.get(id))
            .cloned()
    }

    /// Active alerts at or above `min_severity`, most severe first, then oldest first.
    pub fn active_alerts(&self, min_severity: Option<Severity>) -> Vec<Alert> {
        let inner = self.inner.read().expect("alert store poisoned");
        let mut alerts: Vec<Alert> = inner
            .active
            .values()
            .filter_map(|id| inner.alerts.get(id))
            .filter(|a| min_severity.map_or(true, |min| a.severity >= min))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.opened_at.cmp(&b.opened_at))
        });
        alerts
    }

    /// Every alert, active and resolved, oldest first.
    pub fn all(&self) -> Vec<Alert> {
        let inner = self.inner.read().expect("alert store poisoned");
        let mut alerts: Vec<Alert> = inner.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        alerts
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        let inner = self.inner.read().expect("alert store poisoned");
        inner.alerts.get(id).cloned()
    }

    pub fn summary(&self) -> AlertSummary {
        let active = self.active_alerts(None);
        let mut summary = AlertSummary {
            total_active: active.len(),
            ..Default::default()
        };
        for a in &active {
            *summary.by_severity.entry(a.severity).or_insert(0) += 1;
        }
        summary.oldest_opened_at = active.iter().map(|a| a.opened_at).min();
        summary.newest_opened_at = active.iter().map(|a| a.opened_at).max();
        summary
    }

    /// Drop resolved alerts that were resolved before `cutoff`. Returns how many.
    pub fn purge_resolved(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().expect("alert store poisoned");
        let before = inner.alerts.len();
        inner
            .alerts
            .retain(|_, a| a.is_active() || a.resolved_at.map_or(true, |at| at >= cutoff));
        let purged = before - inner.alerts.len();
        if purged > 0 {
            info!(count = purged, "purged resolved alerts");
        }
        purged
    }

    /// Load alerts saved by a previous process. Active ones are re-indexed so
    /// a still-breaching metric does not open a duplicate.
    pub fn restore(&self, alerts: Vec<Alert>) -> usize {
        let mut inner = self.inner.write().expect("alert store poisoned");
        let mut restored = 0;
        for alert in alerts {
            if alert.is_active() {
                if inner.active.contains_key(&alert.metric) {
                    warn!(alert_id = %alert.id, metric = %alert.metric, "ignoring second active alert for metric");
                    continue;
                }
                inner.active.insert(alert.metric.clone(), alert.id.clone());
            }
            inner.alerts.insert(alert.id.clone(), alert);
            restored += 1;
        }
        restored
    }

    /// Alerts changed since the previous call, for persistence.
    pub fn take_dirty(&self) -> Vec<Alert> {
        let mut inner = self.inner.write().expect("alert store poisoned");
        let ids: Vec<String> = inner.dirty.drain().collect();
        ids.iter().filter_map(|id| inner.alerts.get(id).cloned()).collect()
    }
}

impl Inner {
    fn unique_id(&self, metric: &str, severity: Severity, now: DateTime<Utc>) -> String {
        let base = format!("{metric}:{severity}:{}", now.timestamp());
        let mut id = base.clone();
        let mut n = 1;
        while self.alerts.contains_key(&id) {
            n += 1;
            id = format!("{base}-{n}");
        }
        id
    }

    fn resolve_locked(
        &mut self,
        id: &str,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let alert = self.alerts.get_mut(id)?;
        if !alert.is_active() {
            return None;
        }
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        alert.last_seen_at = now;
        if let Some(v) = value {
            alert.value = v;
        }
        let snapshot = alert.clone();
        self.active.remove(&snapshot.metric);
        self.dirty.insert(id.to_string());
        Some(AlertEvent {
            kind: AlertEventKind::Resolved,
            alert: snapshot,
            previous_severity: None,
            at: now,
        })
    }
}
