use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_core::config::SchedulerConfig;

use crate::{
    clock::Clock,
    db::{Lease, TaskStateStore},
    error::{Result, SchedulerError},
    executor::{ExecutorConfig, TaskExecutor},
    lease::LeaseGuard,
    registry::TaskRegistry,
    task::TaskFunction,
    types::{PersistedTask, RunOutcome, RunTrigger, ScheduleSpec, TaskDefinition, TaskSnapshot, TaskState},
};

/// A due time older than this when admitted is reported as a catch-up run.
const CATCH_UP_AFTER_SECS: i64 = 60;

/// Drives the task registry: every tick, admits due tasks and hands them to
/// the executor. Ticks never wait for a run to finish.
pub struct SchedulerEngine {
    registry: Arc<TaskRegistry>,
    executor: TaskExecutor,
    clock: Arc<dyn Clock>,
    store: Option<Arc<TaskStateStore>>,
    /// Identifies this engine in the store's lease row.
    lease_owner: String,
    lease_ttl: chrono::Duration,
    tick: Duration,
    shutdown_grace: Duration,
}

impl SchedulerEngine {
    pub fn new(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let executor = TaskExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            ExecutorConfig::from(config),
        );
        Self {
            registry,
            executor,
            clock,
            store: None,
            lease_owner: Uuid::new_v4().to_string(),
            lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs.max(config.tick_secs * 3).max(3) as i64),
            tick: Duration::from_secs(config.tick_secs.max(1)),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Persist task state to `store` after every tick.
    pub fn with_store(mut self, store: Arc<TaskStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register(
        &self,
        def: TaskDefinition,
        function: Arc<dyn TaskFunction>,
    ) -> Result<TaskSnapshot> {
        self.registry.register(def, function, self.clock.now())
    }

    /// Claim the attached store for this process.
    ///
    /// Fails with [`SchedulerError::LeaseHeld`] while another live process
    /// owns it. The lease lasts as long as the returned guard; `None` when no
    /// store is attached. Acquire before [`restore`](Self::restore) so runs
    /// cut off by a dead owner are reset.
    pub fn acquire_lease(&self) -> Result<Option<LeaseGuard>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let pid = std::process::id();
        if let Some(holder) =
            store.try_acquire_lease(&self.lease_owner, pid, self.clock.now(), self.lease_ttl)?
        {
            return Err(SchedulerError::LeaseHeld {
                owner: holder.owner,
                pid: holder.pid,
            });
        }
        info!(owner = %self.lease_owner, pid, "state lease acquired");
        Ok(Some(LeaseGuard::hold(
            Arc::clone(store),
            Arc::clone(&self.clock),
            self.lease_owner.clone(),
            self.lease_ttl,
        )))
    }

    /// The live lease of another process on the attached store, if any.
    pub fn foreign_lease(&self) -> Result<Option<Lease>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let now = self.clock.now();
        Ok(store
            .current_lease()?
            .filter(|l| l.owner != self.lease_owner && l.is_live(now, self.lease_ttl)))
    }

    /// Reload saved state for the registered tasks. Call after registration
    /// and before [`run`](Self::run).
    ///
    /// While another process holds the lease its in-flight runs stay
    /// `Running` and rows of unconfigured tasks are left alone.
    pub fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let foreign = self.foreign_lease()?;
        if let Some(holder) = &foreign {
            info!(pid = holder.pid, "task state owned by a live process; loading read-only view");
        }
        let saved = store.load_all()?;
        let restored = self.registry.restore(&saved, self.clock.now(), foreign.is_some());
        if foreign.is_none() {
            let ids: Vec<String> = self.registry.list().into_iter().map(|t| t.id).collect();
            let dropped = store.retain(&ids)?;
            if dropped > 0 {
                info!(count = dropped, "dropped state of tasks no longer configured");
            }
        }
        Ok(restored)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            registry: Arc::clone(&self.registry),
            executor: self.executor.clone(),
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Admit and start every task due at `now`. Returns what was started.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<(String, RunTrigger)> {
        if !self.executor.is_accepting() {
            return Vec::new();
        }
        let mut started = Vec::new();
        for id in self.registry.due(now) {
            // Another tick or a manual trigger may have claimed it first.
            let Some(admission) = self.registry.admit(&id, now) else {
                continue;
            };
            let trigger = if (now - admission.scheduled_for).num_seconds() > CATCH_UP_AFTER_SECS {
                RunTrigger::CatchUp
            } else {
                RunTrigger::Scheduled
            };
            if trigger == RunTrigger::CatchUp {
                info!(
                    task_id = %id,
                    missed = %admission.scheduled_for,
                    "running overdue task once to catch up"
                );
            }
            self.executor.spawn_admitted(&id, admission, trigger);
            started.push((id, trigger));
        }
        started
    }

    /// Write the current state of every task to the store, if one is
    /// attached and no other live process owns it.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            match self.foreign_lease() {
                Ok(None) => {}
                Ok(Some(holder)) => {
                    warn!(pid = holder.pid, "task state owned by another process; not persisting");
                    return;
                }
                Err(e) => {
                    error!("failed to read state lease: {e}");
                    return;
                }
            }
            let rows: Vec<PersistedTask> =
                self.registry.list().iter().map(PersistedTask::from).collect();
            if let Err(e) = store.save_all(&rows) {
                error!("failed to persist task state: {e}");
            }
        }
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`, then drains the
    /// executor within the configured grace period.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tasks = self.registry.len(),
            tick_secs = self.tick.as_secs(),
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = self.tick_at(self.clock.now());
                    if !started.is_empty() {
                        debug!(count = started.len(), "tasks started this tick");
                    }
                    self.persist();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        let abandoned = self.executor.shutdown(self.shutdown_grace).await;
        if abandoned > 0 {
            warn!(count = abandoned, "task runs abandoned at shutdown");
        }
        self.persist();
        info!("scheduler engine stopped");
    }
}

/// Control surface over a running engine. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    registry: Arc<TaskRegistry>,
    executor: TaskExecutor,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.registry.get(id)
    }

    /// Runs started by this process and not yet recorded.
    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    /// Start a run now without touching the schedule. Returns the run ID.
    pub fn trigger(&self, id: &str) -> Result<String> {
        self.executor.trigger(id)
    }

    /// Run now and wait for the outcome.
    pub async fn run_now(&self, id: &str) -> Result<RunOutcome> {
        self.executor.run_now(id).await
    }

    pub fn disable(&self, id: &str) -> Result<TaskState> {
        self.registry.disable(id)
    }

    pub fn enable(&self, id: &str) -> Result<TaskSnapshot> {
        self.registry.enable(id, self.clock.now())
    }

    pub fn reschedule(&self, id: &str, schedule: ScheduleSpec) -> Result<TaskSnapshot> {
        self.registry.reschedule(id, schedule, self.clock.now())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.registry.remove(id)
    }
}
