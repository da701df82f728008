use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use warden_channels::NotificationDispatcher;
use warden_core::clock::Clock;
use warden_core::config::MonitorConfig;
use warden_core::types::{AlertEvent, CONNECTIVITY_METRIC};

use crate::{
    alert::AlertStore,
    db::AlertRepository,
    error::{Result, SamplingError},
    history::MetricHistory,
    sampler::MetricSampler,
    threshold::{ThresholdEvaluator, Verdict},
};

/// The monitoring tick: sample every metric, classify, update alerts and
/// hand transitions to the dispatcher. Runs independently of the scheduler.
pub struct MonitorEngine {
    metrics: Vec<String>,
    sampler: Arc<dyn MetricSampler>,
    evaluator: ThresholdEvaluator,
    alerts: Arc<AlertStore>,
    history: Arc<MetricHistory>,
    clock: Arc<dyn Clock>,
    notifier: Option<NotificationDispatcher>,
    repository: Option<Arc<AlertRepository>>,
    interval: Duration,
    sample_timeout: Duration,
}

impl MonitorEngine {
    pub fn new(
        config: &MonitorConfig,
        sampler: Arc<dyn MetricSampler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metrics: config.metrics.iter().map(|m| m.name.clone()).collect(),
            sampler,
            evaluator: ThresholdEvaluator::new(config.thresholds.clone(), config.hysteresis_ratio),
            alerts: Arc::new(AlertStore::new()),
            history: Arc::new(MetricHistory::new(config.history_capacity)),
            clock,
            notifier: None,
            repository: None,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            sample_timeout: Duration::from_secs(config.sample_timeout_secs.max(1)),
        }
    }

    /// Sample these metrics instead of the configured list.
    pub fn with_metrics(mut self, metrics: Vec<String>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_notifier(mut self, notifier: NotificationDispatcher) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_repository(mut self, repository: Arc<AlertRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn alerts(&self) -> &Arc<AlertStore> {
        &self.alerts
    }

    pub fn history(&self) -> &Arc<MetricHistory> {
        &self.history
    }

    /// Reload alerts and recent samples saved by a previous process.
    /// Returns the number of alerts restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(repo) = &self.repository else {
            return Ok(0);
        };
        let restored = self.alerts.restore(repo.load_all()?);
        if restored > 0 {
            info!(count = restored, active = self.alerts.active_alerts(None).len(), "alerts restored");
        }
        let samples = self.history.restore(repo.recent_samples(self.history.capacity())?);
        debug!(count = samples, "metric history restored");
        Ok(restored)
    }

    /// One monitoring pass at `now`. Returns the alert transitions it caused,
    /// which [`run`](Self::run) forwards to the dispatcher.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        let mut first_failure: Option<(String, SamplingError)> = None;

        for metric in &self.metrics {
            let sample = match tokio::time::timeout(self.sample_timeout, self.sampler.sample(metric)).await {
                Ok(Ok(sample)) => sample,
                Ok(Err(e)) => {
                    warn!(metric = %metric, error = %e, "metric sampling failed");
                    if first_failure.is_none() {
                        first_failure = Some((metric.clone(), e));
                    }
                    continue;
                }
                Err(_) => {
                    let e = SamplingError::Timeout {
                        ms: self.sample_timeout.as_millis() as u64,
                    };
                    warn!(metric = %metric, error = %e, "metric sampling timed out");
                    if first_failure.is_none() {
                        first_failure = Some((metric.clone(), e));
                    }
                    continue;
                }
            };

            debug!(metric = %metric, value = sample.value, "metric sampled");
            let active = self.alerts.active_for(metric);
            let verdict = self.evaluator.evaluate(&sample, active.as_ref());
            self.history.push(sample);
            events.extend(self.alerts.record_evaluation(metric, &verdict, now));
        }

        // A failed read opens (or refreshes) the connectivity alert; a tick
        // where everything was readable resolves it.
        let connectivity = match &first_failure {
            Some((metric, e)) => self.evaluator.sampling_failure(metric, &e.to_string()),
            None => Verdict::Recovered { value: 0.0 },
        };
        events.extend(
            self.alerts
                .record_evaluation(CONNECTIVITY_METRIC, &connectivity, now),
        );

        events
    }

    fn dispatch(&self, events: &[AlertEvent]) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        for event in events {
            notifier.submit(event);
        }
    }

    /// Write changed alerts and new samples to the repository, if attached.
    pub fn persist(&self) {
        if let Some(repo) = &self.repository {
            let dirty = self.alerts.take_dirty();
            if let Err(e) = repo.upsert(&dirty) {
                error!("failed to persist alerts: {e}");
            }
            let samples = self.history.take_unsaved();
            if samples.is_empty() {
                return;
            }
            if let Err(e) = repo
                .record_samples(&samples)
                .and_then(|_| repo.trim_samples(self.history.capacity()))
            {
                error!("failed to persist metric samples: {e}");
            }
        }
    }

    /// Main loop. Ticks every `interval_secs` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            metrics = self.metrics.len(),
            interval_secs = self.interval.as_secs(),
            "monitor engine started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = self.tick_at(self.clock.now()).await;
                    self.dispatch(&events);
                    self.persist();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("monitor engine shutting down");
                        break;
                    }
                }
            }
        }
        self.persist();
    }
}
