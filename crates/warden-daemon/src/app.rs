use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use warden_channels::{
    DispatcherWorkers, LaneStats, LogChannel, NotificationChannel, NotificationDispatcher,
    RetryPolicy, WebhookChannel,
};
use warden_core::clock::Clock;
use warden_core::config::WardenConfig;
use warden_core::types::{Alert, MetricSample, Severity};
use warden_monitor::db::AlertRepository;
use warden_monitor::{
    AlertStore, AlertSummary, MetricHistory, MetricSampler, MonitorEngine, MonitorError,
};
use warden_scheduler::db::TaskStateStore;
use warden_scheduler::lease::LeaseGuard;
use warden_scheduler::types::{RunOutcome, TaskDefinition, TaskSnapshot, TaskState};
use warden_scheduler::{SchedulerEngine, SchedulerError, SchedulerHandle};
use warden_tasks::{DatabaseOps, ReportOps, TaskFactory};

/// Errors surfaced to the operator by the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// External collaborators the daemon is wired against.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub sampler: Arc<dyn MetricSampler>,
    pub db: Arc<dyn DatabaseOps>,
    pub reports: Arc<dyn ReportOps>,
    pub task_store: Option<Arc<TaskStateStore>>,
    pub alert_repo: Option<Arc<AlertRepository>>,
}

/// How a process opens the shared state database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAccess {
    /// Take the scheduler lease; refused while another live process holds it.
    Exclusive,
    /// Read-only view next to a possibly running daemon.
    Shared,
}

/// Point-in-time view for `warden status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub now: DateTime<Utc>,
    pub tasks_total: usize,
    pub tasks_running: usize,
    pub tasks_disabled: usize,
    /// Runs executing in this process.
    pub runs_in_flight: usize,
    pub next_due: Option<(String, DateTime<Utc>)>,
    pub alerts: AlertSummary,
    pub metrics_collected: usize,
    pub last_collection: Option<DateTime<Utc>>,
    pub channels: Vec<LaneStats>,
}

/// Control surface shared by the CLI and the run loop: synchronous queries
/// and commands against the task registry and the alert store.
pub struct App {
    scheduler: SchedulerHandle,
    alerts: Arc<AlertStore>,
    history: Arc<MetricHistory>,
    alert_repo: Option<Arc<AlertRepository>>,
    notifier: NotificationDispatcher,
    clock: Arc<dyn Clock>,
}

/// Everything `warden run` drives.
pub struct Runtime {
    pub app: Arc<App>,
    pub scheduler: SchedulerEngine,
    pub monitor: MonitorEngine,
    pub workers: DispatcherWorkers,
    /// Held for the life of an exclusive runtime.
    pub lease: Option<LeaseGuard>,
}

/// Build channels, dispatcher, scheduler (with the configured task table)
/// and monitor, then reload state saved by a previous process.
///
/// With [`StateAccess::Exclusive`] the scheduler lease is taken before any
/// state is read, and assembly fails while another process holds it.
pub fn assemble(
    config: &WardenConfig,
    deps: Collaborators,
    access: StateAccess,
) -> anyhow::Result<Runtime> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if config.notify.log {
        channels.push(Arc::new(LogChannel));
    }
    for target in &config.notify.webhooks {
        channels.push(Arc::new(WebhookChannel::new(target)?));
    }
    let (notifier, workers) = NotificationDispatcher::spawn(
        channels,
        RetryPolicy::from(&config.notify),
        config.notify.queue_capacity,
    );
    info!(channels = ?notifier.channel_names(), "notification dispatcher started");

    let mut scheduler = SchedulerEngine::new(&config.scheduler, Arc::clone(&deps.clock));
    if let Some(store) = deps.task_store {
        scheduler = scheduler.with_store(store);
    }
    let factory = TaskFactory::from_config(&config.tasks, deps.db, deps.reports);
    for job in config.tasks.effective_jobs() {
        scheduler.register(
            TaskDefinition::new(job.id, job.name, job.schedule),
            factory.build(job.kind),
        )?;
    }
    let lease = match access {
        StateAccess::Exclusive => scheduler.acquire_lease()?,
        StateAccess::Shared => None,
    };
    let restored = scheduler.restore()?;
    info!(tasks = scheduler.handle().list().len(), restored, "task table registered");

    let mut monitor = MonitorEngine::new(&config.monitor, deps.sampler, Arc::clone(&deps.clock))
        .with_notifier(notifier.clone());
    if let Some(repo) = &deps.alert_repo {
        monitor = monitor.with_repository(Arc::clone(repo));
    }
    monitor.restore()?;

    let app = Arc::new(App {
        scheduler: scheduler.handle(),
        alerts: Arc::clone(monitor.alerts()),
        history: Arc::clone(monitor.history()),
        alert_repo: deps.alert_repo,
        notifier,
        clock: deps.clock,
    });

    Ok(Runtime {
        app,
        scheduler,
        monitor,
        workers,
        lease,
    })
}

impl App {
    pub fn status(&self) -> Status {
        let tasks = self.scheduler.list();
        let next_due = tasks
            .iter()
            .filter(|t| t.state == TaskState::Idle)
            .min_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)))
            .map(|t| (t.id.clone(), t.next_run_at));
        Status {
            now: self.clock.now(),
            tasks_total: tasks.len(),
            tasks_running: tasks.iter().filter(|t| t.state == TaskState::Running).count(),
            tasks_disabled: tasks.iter().filter(|t| t.state == TaskState::Disabled).count(),
            runs_in_flight: self.scheduler.in_flight(),
            next_due,
            alerts: self.alerts.summary(),
            metrics_collected: self.history.len(),
            last_collection: self.history.last_collection(),
            channels: self.notifier.stats(),
        }
    }

    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.scheduler.list()
    }

    /// Active alerts, most severe first, optionally at or above `min_severity`.
    pub fn list_active_alerts(&self, min_severity: Option<Severity>) -> Vec<Alert> {
        self.alerts.active_alerts(min_severity)
    }

    /// Samples taken in the last `hours`, oldest first.
    pub fn export_metrics(&self, hours: u32) -> Vec<MetricSample> {
        self.history
            .since(self.clock.now() - chrono::Duration::hours(i64::from(hours)))
    }

    /// Start a manual run now. Returns its run id.
    pub fn trigger(&self, task_id: &str) -> ControlResult<String> {
        Ok(self.scheduler.trigger(task_id)?)
    }

    /// Run a task to completion (oneshot mode).
    pub async fn run_now(&self, task_id: &str) -> ControlResult<RunOutcome> {
        Ok(self.scheduler.run_now(task_id).await?)
    }

    pub fn disable(&self, task_id: &str) -> ControlResult<TaskState> {
        Ok(self.scheduler.disable(task_id)?)
    }

    pub fn enable(&self, task_id: &str) -> ControlResult<TaskSnapshot> {
        Ok(self.scheduler.enable(task_id)?)
    }

    /// Resolve an alert by hand; the resolution is notified like any other.
    pub fn resolve_alert(&self, alert_id: &str) -> ControlResult<Alert> {
        let event = self.alerts.resolve(alert_id, self.clock.now())?;
        self.notifier.submit(&event);
        self.persist_alerts();
        Ok(event.alert)
    }

    /// Forget alerts resolved before `cutoff`, in memory and on disk.
    pub fn purge_resolved(&self, cutoff: DateTime<Utc>) -> ControlResult<usize> {
        let purged = self.alerts.purge_resolved(cutoff);
        if let Some(repo) = &self.alert_repo {
            repo.delete_resolved_before(cutoff)?;
        }
        Ok(purged)
    }

    fn persist_alerts(&self) {
        if let Some(repo) = &self.alert_repo {
            if let Err(e) = repo.upsert(&self.alerts.take_dirty()) {
                warn!("failed to persist alerts: {e}");
            }
        }
    }
}
