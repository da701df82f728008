use std::any::Any;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use warden_core::config::SchedulerConfig;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    registry::{Admission, TaskRegistry},
    task::{TaskContext, TaskError},
    types::{RunOutcome, RunTrigger, TaskFailure},
};

/// Limits applied to every run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of task functions running at once.
    pub workers: usize,
    pub task_timeout: Duration,
    /// How long a cancelled function gets to return before it is aborted.
    pub cancel_grace: Duration,
    /// Consecutive failures that disable a task (0 = never).
    pub failure_ceiling: u32,
}

impl From<&SchedulerConfig> for ExecutorConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            workers: cfg.workers.max(1),
            task_timeout: Duration::from_secs(cfg.task_timeout_secs),
            cancel_grace: Duration::from_secs(cfg.cancel_grace_secs),
            failure_ceiling: cfg.failure_ceiling,
        }
    }
}

/// Runs admitted tasks on a bounded pool.
///
/// Cloning is cheap; every clone drives the same pool. A run holds one of
/// `workers` permits while its function executes, is cancelled after
/// `task_timeout`, and always ends by recording a [`RunOutcome`] on the
/// registry. Panics and errors inside a task function become failed
/// outcomes and never reach the caller.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Cancelled when shutdown gives up waiting; parent of every run's token.
    abandon: CancellationToken,
    accepting: AtomicBool,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry,
                clock,
                config,
                permits,
                tracker: TaskTracker::new(),
                abandon: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Number of runs started and not yet recorded.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Start a run the registry has already admitted. Returns the run ID.
    pub fn spawn_admitted(&self, task_id: &str, admission: Admission, trigger: RunTrigger) -> String {
        let run_id = Uuid::now_v7().to_string();
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        let rid = run_id.clone();
        self.inner.tracker.spawn(async move {
            inner.execute(&task_id, &rid, admission, trigger).await;
        });
        run_id
    }

    /// Force an immediate run in the background, bypassing the schedule.
    ///
    /// Refused while the task is running or disabled, and after shutdown began.
    pub fn trigger(&self, task_id: &str) -> Result<String> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        let admission = self
            .inner
            .registry
            .admit_manual(task_id, self.inner.clock.now())?;
        info!(task_id = %task_id, "manual run requested");
        Ok(self.spawn_admitted(task_id, admission, RunTrigger::Manual))
    }

    /// Force an immediate run and wait for its outcome.
    pub async fn run_now(&self, task_id: &str) -> Result<RunOutcome> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        let admission = self
            .inner
            .registry
            .admit_manual(task_id, self.inner.clock.now())?;
        let run_id = Uuid::now_v7().to_string();
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        let handle = self.inner.tracker.spawn(async move {
            inner
                .execute(&task_id, &run_id, admission, RunTrigger::Manual)
                .await
        });
        Ok(handle
            .await
            .unwrap_or(RunOutcome::Failed(TaskFailure::Shutdown)))
    }

    /// Stop admitting runs, wait up to `grace` for in-flight ones, then
    /// cancel the rest and record them as failed-by-shutdown.
    ///
    /// Returns the number of runs that had to be abandoned.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.tracker.close();

        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            info!("all in-flight task runs finished");
            return 0;
        }

        let stuck = self.inner.registry.running();
        warn!(count = stuck.len(), tasks = ?stuck, "shutdown grace expired; abandoning task runs");
        self.inner.abandon.cancel();

        // Each run records its own Shutdown outcome once its function returns
        // or is aborted; anything still unrecorded after that is recorded here.
        let settle = self.inner.config.cancel_grace + Duration::from_secs(1);
        if tokio::time::timeout(settle, self.inner.tracker.wait())
            .await
            .is_err()
        {
            let now = self.inner.clock.now();
            for id in self.inner.registry.running() {
                self.inner.registry.complete(
                    &id,
                    RunTrigger::Scheduled,
                    &RunOutcome::Failed(TaskFailure::Shutdown),
                    now,
                    self.inner.config.failure_ceiling,
                );
            }
        }
        stuck.len()
    }
}

impl Inner {
    async fn execute(
        &self,
        task_id: &str,
        run_id: &str,
        admission: Admission,
        trigger: RunTrigger,
    ) -> RunOutcome {
        let outcome = self.run(task_id, run_id, admission, trigger).await;

        match &outcome {
            RunOutcome::Succeeded { message } => info!(
                task_id = %task_id,
                run_id = %run_id,
                message = message.as_deref().unwrap_or(""),
                "task run succeeded"
            ),
            RunOutcome::Failed(failure) => warn!(
                task_id = %task_id,
                run_id = %run_id,
                error = %failure,
                "task run failed"
            ),
        }

        self.registry.complete(
            task_id,
            trigger,
            &outcome,
            self.clock.now(),
            self.config.failure_ceiling,
        );
        outcome
    }

    async fn run(
        &self,
        task_id: &str,
        run_id: &str,
        admission: Admission,
        trigger: RunTrigger,
    ) -> RunOutcome {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return RunOutcome::Failed(TaskFailure::Shutdown),
            },
            _ = self.abandon.cancelled() => return RunOutcome::Failed(TaskFailure::Shutdown),
        };

        info!(
            task_id = %task_id,
            run_id = %run_id,
            trigger = %trigger,
            scheduled_for = %admission.scheduled_for,
            "task run started"
        );

        let cancel = self.abandon.child_token();
        let ctx = TaskContext {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            trigger,
            scheduled_for: admission.scheduled_for,
            started_at: self.clock.now(),
            cancel: cancel.clone(),
        };
        let function = admission.function;
        // A separate task so a panic surfaces as a JoinError instead of
        // unwinding through the executor.
        let mut handle = tokio::spawn(async move { function.execute(ctx).await });

        // Shutdown takes precedence: a function that returns because its
        // token fired is still an abandoned run.
        tokio::select! {
            biased;
            _ = self.abandon.cancelled() => {
                self.reap(&mut handle).await;
                RunOutcome::Failed(TaskFailure::Shutdown)
            }
            joined = &mut handle => outcome_from_join(joined),
            _ = tokio::time::sleep(self.config.task_timeout) => {
                cancel.cancel();
                self.reap(&mut handle).await;
                RunOutcome::Failed(TaskFailure::Timeout {
                    secs: self.config.task_timeout.as_secs(),
                })
            }
        }
    }

    /// Give a cancelled function `cancel_grace` to return, then abort it.
    /// Either way it has stopped when this returns, so the task can run again
    /// without overlapping.
    async fn reap<T>(&self, handle: &mut JoinHandle<T>) {
        if tokio::time::timeout(self.config.cancel_grace, &mut *handle)
            .await
            .is_err()
        {
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn outcome_from_join(
    joined: std::result::Result<std::result::Result<Option<String>, TaskError>, JoinError>,
) -> RunOutcome {
    match joined {
        Ok(Ok(message)) => RunOutcome::Succeeded { message },
        Ok(Err(e)) => RunOutcome::Failed(TaskFailure::Execution(e.to_string())),
        Err(e) if e.is_panic() => {
            RunOutcome::Failed(TaskFailure::Panicked(panic_message(e.into_panic())))
        }
        Err(e) => RunOutcome::Failed(TaskFailure::Execution(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
