use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_core::types::AlertEvent;

use crate::{channel::NotificationChannel, error::DeliveryError, retry::RetryPolicy};

/// Delivery counters for one channel lane.
#[derive(Debug, Default)]
struct LaneCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time delivery statistics for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub channel: String,
    pub delivered: u64,
    /// Gave up after a permanent error or the retry ceiling.
    pub failed: u64,
    /// Never queued because the lane was full or stopped.
    pub dropped: u64,
}

struct Lane {
    name: String,
    tx: mpsc::Sender<AlertEvent>,
    counters: Arc<LaneCounters>,
}

/// Fans alert events out to every channel without blocking the caller.
///
/// Each channel has its own lane: a bounded queue and a worker task with its
/// own retry state, so a slow or failing channel never delays another.
/// Cloning is cheap; all clones feed the same lanes.
#[derive(Clone)]
pub struct NotificationDispatcher {
    lanes: Arc<Vec<Lane>>,
}

/// The worker tasks behind a [`NotificationDispatcher`].
pub struct DispatcherWorkers {
    workers: JoinSet<()>,
    stop: CancellationToken,
}

impl NotificationDispatcher {
    /// Spawn one worker per channel. Must be called inside a Tokio runtime.
    pub fn spawn(
        channels: Vec<Arc<dyn NotificationChannel>>,
        policy: RetryPolicy,
        queue_capacity: usize,
    ) -> (Self, DispatcherWorkers) {
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();
        let mut lanes = Vec::with_capacity(channels.len());

        for channel in channels {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let counters = Arc::new(LaneCounters::default());
            let name = channel.name().to_string();
            info!(channel = %name, "notification channel registered");
            workers.spawn(lane_worker(
                channel,
                rx,
                policy.clone(),
                Arc::clone(&counters),
                stop.clone(),
            ));
            lanes.push(Lane { name, tx, counters });
        }

        (
            Self {
                lanes: Arc::new(lanes),
            },
            DispatcherWorkers { workers, stop },
        )
    }

    /// Queue `event` on every lane. Never blocks; a full lane drops the event
    /// with a warning. Returns the number of lanes that accepted it.
    pub fn submit(&self, event: &AlertEvent) -> usize {
        let mut accepted = 0;
        for lane in self.lanes.iter() {
            match lane.tx.try_send(event.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "lane stopped",
                    };
                    warn!(
                        channel = %lane.name,
                        alert_id = %event.alert.id,
                        reason,
                        "alert event dropped"
                    );
                }
            }
        }
        accepted
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.lanes.iter().map(|l| l.name.clone()).collect()
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes
            .iter()
            .map(|l| LaneStats {
                channel: l.name.clone(),
                delivered: l.counters.delivered.load(Ordering::Relaxed),
                failed: l.counters.failed.load(Ordering::Relaxed),
                dropped: l.counters.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl DispatcherWorkers {
    /// Stop every lane. Events already queued get one final attempt each;
    /// workers still busy after `grace` are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.stop.cancel();
        let drained = tokio::time::timeout(grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.workers.len(),
                "notification workers did not stop in time; aborting"
            );
            self.workers.shutdown().await;
        }
        info!("notification dispatcher stopped");
    }
}

async fn lane_worker(
    channel: Arc<dyn NotificationChannel>,
    mut rx: mpsc::Receiver<AlertEvent>,
    policy: RetryPolicy,
    counters: Arc<LaneCounters>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => {
                    let delivered = deliver_with_retry(channel.as_ref(), &policy, &event, &stop).await;
                    record(&counters, delivered);
                }
                None => return,
            },
        }
    }

    // Stopping: no more backoff, but give queued events one attempt.
    rx.close();
    while let Ok(event) = rx.try_recv() {
        let delivered = match channel.deliver(&event).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    channel = %channel.name(),
                    alert_id = %event.alert.id,
                    error = %e,
                    "alert notification lost at shutdown"
                );
                false
            }
        };
        record(&counters, delivered);
    }
}

fn record(counters: &LaneCounters, delivered: bool) {
    if delivered {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Deliver `event`, retrying transient failures with backoff until the policy
/// ceiling. Failures are logged, never returned. Returns whether it got through.
pub async fn deliver_with_retry(
    channel: &dyn NotificationChannel,
    policy: &RetryPolicy,
    event: &AlertEvent,
    stop: &CancellationToken,
) -> bool {
    let name = channel.name();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match channel.deliver(event).await {
            Ok(()) => {
                debug!(channel = %name, alert_id = %event.alert.id, kind = %event.kind, attempt, "alert notification delivered");
                return true;
            }
            Err(DeliveryError::Permanent(reason)) => {
                error!(
                    channel = %name,
                    alert_id = %event.alert.id,
                    attempt,
                    error = %reason,
                    "alert notification rejected permanently"
                );
                return false;
            }
            Err(DeliveryError::Transient(reason)) if !policy.allows_retry(attempt) => {
                error!(
                    channel = %name,
                    alert_id = %event.alert.id,
                    attempts = attempt,
                    error = %reason,
                    "alert notification failed after retry ceiling"
                );
                return false;
            }
            Err(DeliveryError::Transient(reason)) => {
                let delay = policy.next_delay(attempt);
                warn!(
                    channel = %name,
                    alert_id = %event.alert.id,
                    attempt,
                    max = policy.max_attempts,
                    error = %reason,
                    retry_after_ms = delay.as_millis() as u64,
                    "alert notification failed, retrying with backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => {
                        warn!(channel = %name, alert_id = %event.alert.id, "retry abandoned at shutdown");
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use warden_core::types::{Alert, AlertEventKind, AlertState, Comparison, Severity};

    fn event(id: &str) -> AlertEvent {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        AlertEvent {
            kind: AlertEventKind::Opened,
            alert: Alert {
                id: id.to_string(),
                metric: "cpu_usage".into(),
                severity: Severity::High,
                message: "cpu_usage 82.00 >= 80.00".into(),
                state: AlertState::Active,
                value: 82.0,
                op: Comparison::Ge,
                boundary: 80.0,
                opened_at: at,
                last_seen_at: at,
                resolved_at: None,
            },
            previous_severity: None,
            at,
        }
    }

    /// Fails transiently `fail_first` times, then succeeds (or fails permanently).
    struct Scripted {
        name: String,
        fail_first: u32,
        permanent: bool,
        attempts: AtomicU32,
        delivered: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &str, fail_first: u32, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_first,
                permanent,
                attempts: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotificationChannel for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.permanent {
                return Err(DeliveryError::Permanent("401 unauthorized".into()));
            }
            if n <= self.fail_first {
                return Err(DeliveryError::Transient("connection reset".into()));
            }
            self.delivered.lock().unwrap().push(event.alert.id.clone());
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let ch = Scripted::new("flaky", 2, false);
        let ok = deliver_with_retry(ch.as_ref(), &fast_policy(5), &event("a"), &CancellationToken::new()).await;
        assert!(ok);
        assert_eq!(ch.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_ceiling_stops_attempts() {
        let ch = Scripted::new("down", 100, false);
        let ok = deliver_with_retry(ch.as_ref(), &fast_policy(4), &event("a"), &CancellationToken::new()).await;
        assert!(!ok);
        assert_eq!(ch.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let ch = Scripted::new("bad-auth", 0, true);
        let ok = deliver_with_retry(ch.as_ref(), &fast_policy(5), &event("a"), &CancellationToken::new()).await;
        assert!(!ok);
        assert_eq!(ch.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let good = Scripted::new("good", 0, false);
        let bad = Scripted::new("bad", 0, true);
        let (dispatcher, workers) = NotificationDispatcher::spawn(
            vec![good.clone() as Arc<dyn NotificationChannel>, bad.clone()],
            fast_policy(3),
            16,
        );

        assert_eq!(dispatcher.submit(&event("a")), 2);
        assert_eq!(dispatcher.submit(&event("b")), 2);
        workers.shutdown(Duration::from_secs(2)).await;

        assert_eq!(*good.delivered.lock().unwrap(), vec!["a", "b"]);
        let stats = dispatcher.stats();
        assert_eq!(stats[0].delivered, 2);
        assert_eq!(stats[1].failed, 2);
    }

    #[tokio::test]
    async fn full_lane_drops_without_blocking() {
        // A channel that never finishes keeps the lane's worker busy.
        struct Stuck;
        #[async_trait]
        impl NotificationChannel for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }
            async fn deliver(&self, _event: &AlertEvent) -> Result<(), DeliveryError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let (dispatcher, workers) =
            NotificationDispatcher::spawn(
            vec![Arc::new(Stuck) as Arc<dyn NotificationChannel>],
            fast_policy(1),
            1,
        );
        dispatcher.submit(&event("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // "a" is in flight; "b" fills the queue; "c" is dropped.
        assert_eq!(dispatcher.submit(&event("b")), 1);
        assert_eq!(dispatcher.submit(&event("c")), 0);
        assert_eq!(dispatcher.stats()[0].dropped, 1);
        workers.shutdown(Duration::from_millis(50)).await;
    }
}
