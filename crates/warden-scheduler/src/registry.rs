use std::cmp::max;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    schedule::{initial_run_at, next_occurrence, validate},
    task::TaskFunction,
    types::{
        PersistedTask, RunOutcome, RunTrigger, ScheduleSpec, TaskDefinition, TaskSnapshot,
        TaskState,
    },
};

struct TaskEntry {
    def: TaskDefinition,
    function: Arc<dyn TaskFunction>,
    state: TaskState,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    consecutive_failures: u32,
    last_error: Option<String>,
    run_count: u64,
    disable_requested: bool,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.def.id.clone(),
            name: self.def.name.clone(),
            schedule: self.def.schedule.clone(),
            state: self.state,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            run_count: self.run_count,
            disable_requested: self.disable_requested,
        }
    }
}

/// What the executor needs to start a run the registry just admitted.
pub struct Admission {
    pub function: Arc<dyn TaskFunction>,
    pub scheduled_for: DateTime<Utc>,
}

/// Owner of every task record.
///
/// All state transitions go through here. Each record sits behind its own
/// DashMap shard lock, so transitions on one task are sequenced while
/// different tasks proceed independently. The Idle -> Running flip in
/// [`admit`](Self::admit) is the only way a run starts, which is what keeps
/// two runs of the same task from overlapping.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Register a task. Its first due time comes from [`initial_run_at`].
    pub fn register(
        &self,
        def: TaskDefinition,
        function: Arc<dyn TaskFunction>,
        now: DateTime<Utc>,
    ) -> Result<TaskSnapshot> {
        validate(&def.schedule)?;
        if self.tasks.contains_key(&def.id) {
            return Err(SchedulerError::DuplicateTask { id: def.id });
        }

        let entry = TaskEntry {
            next_run_at: initial_run_at(&def.schedule, now),
            def,
            function,
            state: TaskState::Idle,
            last_run_at: None,
            consecutive_failures: 0,
            last_error: None,
            run_count: 0,
            disable_requested: false,
        };
        let snapshot = entry.snapshot();
        info!(task_id = %snapshot.id, schedule = %snapshot.schedule, next_run_at = %snapshot.next_run_at, "task registered");
        self.tasks.insert(snapshot.id.clone(), entry);
        Ok(snapshot)
    }

    /// Remove a task. Refused while a run is in flight.
    pub fn remove(&self, id: &str) -> Result<()> {
        let removed = self
            .tasks
            .remove_if(id, |_, entry| entry.state != TaskState::Running);
        match removed {
            Some(_) => {
                info!(task_id = %id, "task removed");
                Ok(())
            }
            None if self.tasks.contains_key(id) => {
                Err(SchedulerError::AlreadyRunning { id: id.to_string() })
            }
            None => Err(SchedulerError::TaskNotFound { id: id.to_string() }),
        }
    }

    /// Overlay state saved by another process onto the registered tasks.
    ///
    /// Records for tasks no longer registered are ignored. With
    /// `writer_alive` unset the writer is gone: a task saved as `Running` was
    /// cut off mid-run and comes back `Idle`, its due time kept so an overdue
    /// task catches up on the next tick. With it set the run is still in
    /// flight elsewhere and the task stays `Running` here, which refuses
    /// manual runs. A saved due time computed from a different schedule than
    /// the registered one is discarded for the next occurrence after `now`.
    pub fn restore(&self, saved: &[PersistedTask], now: DateTime<Utc>, writer_alive: bool) -> usize {
        let mut restored = 0;
        for record in saved {
            let Some(mut entry) = self.tasks.get_mut(&record.id) else {
                warn!(task_id = %record.id, "saved state for unknown task ignored");
                continue;
            };
            let next_run_at = match &record.schedule {
                Some(previous) if *previous != entry.def.schedule => {
                    let next = next_occurrence(&entry.def.schedule, now);
                    info!(
                        task_id = %record.id,
                        was = %previous,
                        now = %entry.def.schedule,
                        next_run_at = %next,
                        "schedule changed since last run; due time recomputed"
                    );
                    next
                }
                _ => record.next_run_at,
            };
            entry.next_run_at = next_run_at;
            entry.last_run_at = record.last_run_at;
            entry.consecutive_failures = record.consecutive_failures;
            entry.last_error = record.last_error.clone();
            entry.run_count = record.run_count;
            entry.state = match record.state {
                TaskState::Disabled => TaskState::Disabled,
                TaskState::Running if writer_alive => TaskState::Running,
                TaskState::Running => {
                    warn!(task_id = %record.id, "task was running at last shutdown; resetting to idle");
                    TaskState::Idle
                }
                TaskState::Idle => TaskState::Idle,
            };
            restored += 1;
        }
        restored
    }

    /// IDs of Idle tasks whose due time has arrived, earliest first, ties by ID.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .tasks
            .iter()
            .filter(|e| e.state == TaskState::Idle && e.next_run_at <= now)
            .map(|e| (e.next_run_at, e.key().clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Flip a due Idle task to Running. `None` if it is no longer due or idle.
    pub fn admit(&self, id: &str, now: DateTime<Utc>) -> Option<Admission> {
        let mut entry = self.tasks.get_mut(id)?;
        if entry.state != TaskState::Idle || entry.next_run_at > now {
            return None;
        }
        entry.state = TaskState::Running;
        Some(Admission {
            function: Arc::clone(&entry.function),
            scheduled_for: entry.next_run_at,
        })
    }

    /// Flip an Idle task to Running regardless of its schedule.
    pub fn admit_manual(&self, id: &str, now: DateTime<Utc>) -> Result<Admission> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        match entry.state {
            TaskState::Running => Err(SchedulerError::AlreadyRunning { id: id.to_string() }),
            TaskState::Disabled => Err(SchedulerError::TaskDisabled { id: id.to_string() }),
            TaskState::Idle => {
                entry.state = TaskState::Running;
                Ok(Admission {
                    function: Arc::clone(&entry.function),
                    scheduled_for: now,
                })
            }
        }
    }

    /// Record the end of a run of a Running task and return it to Idle, or Disabled once
    /// `failure_ceiling` consecutive failures are reached (0 disables the ceiling).
    ///
    /// Scheduled and catch-up runs move `next_run_at` past both `now` and the
    /// slot they served; manual runs leave it alone.
    pub fn complete(
        &self,
        id: &str,
        trigger: RunTrigger,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
        failure_ceiling: u32,
    ) -> Option<TaskState> {
        let mut entry = self.tasks.get_mut(id)?;
        if entry.state != TaskState::Running {
            return None;
        }
        entry.run_count += 1;
        entry.last_run_at = Some(now);

        match outcome {
            RunOutcome::Succeeded { .. } => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
            RunOutcome::Failed(failure) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(failure.to_string());
            }
        }

        let exhausted = failure_ceiling > 0 && entry.consecutive_failures >= failure_ceiling;
        if exhausted || entry.disable_requested {
            entry.state = TaskState::Disabled;
            entry.disable_requested = false;
            if exhausted {
                error!(
                    task_id = %id,
                    failures = entry.consecutive_failures,
                    last_error = entry.last_error.as_deref().unwrap_or(""),
                    "task disabled after consecutive failures; re-enable required"
                );
            } else {
                info!(task_id = %id, "task disabled after in-flight run");
            }
            return Some(TaskState::Disabled);
        }

        if trigger != RunTrigger::Manual {
            let reference = max(now, entry.next_run_at);
            entry.next_run_at = next_occurrence(&entry.def.schedule, reference);
        }
        entry.state = TaskState::Idle;
        Some(TaskState::Idle)
    }

    /// Stop scheduling a task. A task mid-run is disabled when the run ends.
    pub fn disable(&self, id: &str) -> Result<TaskState> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        match entry.state {
            TaskState::Running => {
                entry.disable_requested = true;
                info!(task_id = %id, "disable requested; takes effect after the current run");
            }
            TaskState::Idle => {
                entry.state = TaskState::Disabled;
                info!(task_id = %id, "task disabled");
            }
            TaskState::Disabled => {}
        }
        Ok(entry.state)
    }

    /// Return a disabled task to the schedule with a clean failure count.
    pub fn enable(&self, id: &str, now: DateTime<Utc>) -> Result<TaskSnapshot> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        match entry.state {
            TaskState::Disabled => {
                entry.state = TaskState::Idle;
                entry.consecutive_failures = 0;
                entry.next_run_at = next_occurrence(&entry.def.schedule, now);
                info!(task_id = %id, next_run_at = %entry.next_run_at, "task enabled");
            }
            TaskState::Running => entry.disable_requested = false,
            TaskState::Idle => {}
        }
        Ok(entry.snapshot())
    }

    /// Attach a new schedule. Idle and Disabled tasks get a fresh due time;
    /// a running task picks it up when its run completes.
    pub fn reschedule(
        &self,
        id: &str,
        schedule: ScheduleSpec,
        now: DateTime<Utc>,
    ) -> Result<TaskSnapshot> {
        validate(&schedule)?;
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        entry.def.schedule = schedule;
        if entry.state != TaskState::Running {
            entry.next_run_at = next_occurrence(&entry.def.schedule, now);
        }
        info!(task_id = %id, schedule = %entry.def.schedule, "task rescheduled");
        Ok(entry.snapshot())
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(id).map(|e| e.snapshot())
    }

    /// Snapshots of every task, sorted by ID.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self.tasks.iter().map(|e| e.snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// IDs of tasks currently Running, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| e.state == TaskState::Running)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskContext, TaskError};
    use crate::types::TaskFailure;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Weekday};

    struct Noop;

    #[async_trait]
    impl TaskFunction for Noop {
        async fn execute(&self, _ctx: TaskContext) -> std::result::Result<Option<String>, TaskError> {
            Ok(None)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 5, 0).unwrap()
    }

    fn registry_with(id: &str, schedule: ScheduleSpec) -> TaskRegistry {
        let reg = TaskRegistry::new();
        reg.register(TaskDefinition::new(id, id, schedule), Arc::new(Noop), t0())
            .unwrap();
        reg
    }

    fn failed() -> RunOutcome {
        RunOutcome::Failed(TaskFailure::Execution("boom".into()))
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 60 });
        let err = reg
            .register(
                TaskDefinition::new("a", "again", ScheduleSpec::Interval { every_secs: 5 }),
                Arc::new(Noop),
                t0(),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { .. }));
    }

    #[test]
    fn due_orders_by_time_then_id() {
        let reg = TaskRegistry::new();
        let every = ScheduleSpec::Interval { every_secs: 60 };
        for id in ["b", "a", "c"] {
            reg.register(TaskDefinition::new(id, id, every.clone()), Arc::new(Noop), t0())
                .unwrap();
        }
        reg.register(
            TaskDefinition::new("early", "early", ScheduleSpec::Daily { hour: 0, minute: 0 }),
            Arc::new(Noop),
            t0(),
        )
        .unwrap();
        assert_eq!(reg.due(t0()), vec!["early", "a", "b", "c"]);
    }

    #[test]
    fn admit_only_once_until_completed() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 60 });
        assert!(reg.admit("a", t0()).is_some());
        assert!(reg.admit("a", t0()).is_none());
        assert!(matches!(
            reg.admit_manual("a", t0()),
            Err(SchedulerError::AlreadyRunning { .. })
        ));
        assert_eq!(reg.running(), vec!["a"]);
    }

    #[test]
    fn completion_reschedules_from_later_of_now_and_slot() {
        let reg = registry_with("daily", ScheduleSpec::Daily { hour: 8, minute: 0 });
        let slot = reg.get("daily").unwrap().next_run_at;
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());

        reg.admit("daily", t0()).unwrap();
        let state = reg.complete(
            "daily",
            RunTrigger::CatchUp,
            &RunOutcome::Succeeded { message: None },
            t0(),
            3,
        );
        assert_eq!(state, Some(TaskState::Idle));
        let snap = reg.get("daily").unwrap();
        assert_eq!(snap.next_run_at, Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap());
        assert_eq!(snap.last_run_at, Some(t0()));
        assert_eq!(snap.run_count, 1);
    }

    #[test]
    fn ceiling_disables_and_blocks_admission() {
        let reg = registry_with("flaky", ScheduleSpec::Interval { every_secs: 1 });
        let mut now = t0();
        for attempt in 1..=3 {
            reg.admit("flaky", now).expect("admitted");
            let state = reg.complete("flaky", RunTrigger::Scheduled, &failed(), now, 3);
            let expected = if attempt < 3 { TaskState::Idle } else { TaskState::Disabled };
            assert_eq!(state, Some(expected));
            now += Duration::seconds(5);
        }
        assert!(reg.due(now).is_empty());
        assert!(reg.admit("flaky", now).is_none());
        assert!(matches!(
            reg.admit_manual("flaky", now),
            Err(SchedulerError::TaskDisabled { .. })
        ));

        let snap = reg.enable("flaky", now).unwrap();
        assert_eq!(snap.state, TaskState::Idle);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.next_run_at, now + Duration::seconds(1));
    }

    #[test]
    fn success_resets_failure_count() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 1 });
        reg.admit("a", t0()).unwrap();
        reg.complete("a", RunTrigger::Scheduled, &failed(), t0(), 5);
        assert_eq!(reg.get("a").unwrap().consecutive_failures, 1);
        assert_eq!(reg.get("a").unwrap().last_error.as_deref(), Some("boom"));

        let later = t0() + Duration::seconds(2);
        reg.admit("a", later).unwrap();
        reg.complete(
            "a",
            RunTrigger::Scheduled,
            &RunOutcome::Succeeded { message: None },
            later,
            5,
        );
        let snap = reg.get("a").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn manual_run_keeps_next_run_at() {
        let reg = registry_with("report", ScheduleSpec::Daily { hour: 23, minute: 0 });
        let before = reg.get("report").unwrap().next_run_at;
        reg.admit_manual("report", t0()).unwrap();
        reg.complete(
            "report",
            RunTrigger::Manual,
            &RunOutcome::Succeeded { message: None },
            t0(),
            5,
        );
        let snap = reg.get("report").unwrap();
        assert_eq!(snap.next_run_at, before);
        assert_eq!(snap.state, TaskState::Idle);
    }

    #[test]
    fn disable_while_running_applies_on_completion() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 1 });
        reg.admit("a", t0()).unwrap();
        assert_eq!(reg.disable("a").unwrap(), TaskState::Running);
        let state = reg.complete(
            "a",
            RunTrigger::Scheduled,
            &RunOutcome::Succeeded { message: None },
            t0(),
            5,
        );
        assert_eq!(state, Some(TaskState::Disabled));
    }

    #[test]
    fn remove_refuses_running_tasks() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 1 });
        reg.admit("a", t0()).unwrap();
        assert!(matches!(reg.remove("a"), Err(SchedulerError::AlreadyRunning { .. })));
        reg.complete(
            "a",
            RunTrigger::Scheduled,
            &RunOutcome::Succeeded { message: None },
            t0(),
            5,
        );
        reg.remove("a").unwrap();
        assert!(reg.is_empty());
        assert!(matches!(reg.remove("a"), Err(SchedulerError::TaskNotFound { .. })));
    }

    #[test]
    fn restore_resets_running_and_keeps_overdue_slot() {
        let reg = registry_with("a", ScheduleSpec::Daily { hour: 8, minute: 0 });
        let stale = t0() - Duration::days(3);
        let restored = reg.restore(
            &[
                PersistedTask {
                    id: "a".into(),
                    state: TaskState::Running,
                    next_run_at: stale,
                    last_run_at: Some(stale - Duration::days(1)),
                    consecutive_failures: 2,
                    last_error: Some("previous".into()),
                    run_count: 9,
                    schedule: Some(ScheduleSpec::Daily { hour: 8, minute: 0 }),
                },
                PersistedTask {
                    id: "gone".into(),
                    state: TaskState::Idle,
                    next_run_at: stale,
                    last_run_at: None,
                    consecutive_failures: 0,
                    last_error: None,
                    run_count: 0,
                    schedule: None,
                },
            ],
            t0(),
            false,
        );
        assert_eq!(restored, 1);
        let snap = reg.get("a").unwrap();
        assert_eq!(snap.state, TaskState::Idle);
        assert_eq!(snap.next_run_at, stale);
        assert_eq!(snap.consecutive_failures, 2);
        assert_eq!(reg.due(t0()), vec!["a"]);
    }

    #[test]
    fn restore_keeps_running_while_writer_alive() {
        let reg = registry_with("a", ScheduleSpec::Daily { hour: 8, minute: 0 });
        let slot = t0() - Duration::minutes(5);
        reg.restore(
            &[PersistedTask {
                id: "a".into(),
                state: TaskState::Running,
                next_run_at: slot,
                last_run_at: None,
                consecutive_failures: 0,
                last_error: None,
                run_count: 0,
                schedule: Some(ScheduleSpec::Daily { hour: 8, minute: 0 }),
            }],
            t0(),
            true,
        );
        assert_eq!(reg.get("a").unwrap().state, TaskState::Running);
        assert!(reg.due(t0()).is_empty());
        assert!(matches!(
            reg.admit_manual("a", t0()),
            Err(SchedulerError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn restore_recomputes_due_time_when_schedule_changed() {
        // Saved on Monday 09:00 under a Sunday-only schedule.
        let monday = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 3, 8, 2, 0, 0).unwrap();
        let reg = registry_with("backup", ScheduleSpec::Daily { hour: 2, minute: 0 });
        reg.restore(
            &[PersistedTask {
                id: "backup".into(),
                state: TaskState::Idle,
                next_run_at: sunday,
                last_run_at: Some(monday - Duration::hours(7)),
                consecutive_failures: 0,
                last_error: None,
                run_count: 4,
                schedule: Some(ScheduleSpec::Weekly {
                    day: Weekday::Sun,
                    hour: 2,
                    minute: 0,
                }),
            }],
            monday,
            false,
        );
        let snap = reg.get("backup").unwrap();
        assert_eq!(snap.next_run_at, Utc.with_ymd_and_hms(2026, 3, 3, 2, 0, 0).unwrap());
        assert_eq!(snap.run_count, 4);
    }

    #[test]
    fn restore_trusts_due_time_of_unchanged_or_unrecorded_schedule() {
        let later = t0() + Duration::days(2);
        for schedule in [Some(ScheduleSpec::Daily { hour: 8, minute: 0 }), None] {
            let reg = registry_with("a", ScheduleSpec::Daily { hour: 8, minute: 0 });
            reg.restore(
                &[PersistedTask {
                    id: "a".into(),
                    state: TaskState::Idle,
                    next_run_at: later,
                    last_run_at: None,
                    consecutive_failures: 0,
                    last_error: None,
                    run_count: 0,
                    schedule,
                }],
                t0(),
                false,
            );
            assert_eq!(reg.get("a").unwrap().next_run_at, later);
        }
    }

    #[test]
    fn reschedule_recomputes_due_time() {
        let reg = registry_with("a", ScheduleSpec::Interval { every_secs: 60 });
        let snap = reg
            .reschedule("a", ScheduleSpec::Daily { hour: 9, minute: 30 }, t0())
            .unwrap();
        assert_eq!(snap.next_run_at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap());
        assert!(reg
            .reschedule("a", ScheduleSpec::Interval { every_secs: 0 }, t0())
            .is_err());
    }
}
