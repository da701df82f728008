use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc, Weekday};
use tokio::sync::watch;

use warden_core::config::SchedulerConfig;
use warden_scheduler::db::TaskStateStore;
use warden_scheduler::types::PersistedTask;
use warden_scheduler::{
    Clock, ManualClock, RunTrigger, ScheduleSpec, SchedulerEngine, SchedulerError,
    SchedulerHandle, TaskContext, TaskDefinition, TaskError, TaskFunction, TaskState,
};

/// Counts runs and concurrency; optionally fails or sleeps.
#[derive(Default)]
struct Recorder {
    runs: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    sleep_ms: u64,
    fail: bool,
}

impl Recorder {
    fn sleeping(ms: u64) -> Arc<Self> {
        Arc::new(Self {
            sleep_ms: ms,
            ..Default::default()
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }
}

#[async_trait]
impl TaskFunction for Recorder {
    async fn execute(&self, ctx: TaskContext) -> Result<Option<String>, TaskError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.sleep_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.sleep_ms)) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(TaskError::failed("connection refused"))
        } else {
            Ok(Some(format!("ran {}", ctx.task_id)))
        }
    }
}

fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        failure_ceiling: 3,
        task_timeout_secs: 5,
        shutdown_grace_secs: 1,
        cancel_grace_secs: 1,
        ..Default::default()
    }
}

async fn wait_idle(handle: &SchedulerHandle, id: &str) {
    for _ in 0..200 {
        if handle.get(id).is_some_and(|t| t.state != TaskState::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never finished");
}

#[tokio::test]
async fn daily_task_first_seen_after_slot_runs_once_then_waits_for_tomorrow() {
    let clock = Arc::new(ManualClock::new(utc(2, 8, 5)));
    let engine = SchedulerEngine::new(&config(), clock.clone());
    let recorder = Recorder::sleeping(0);
    engine
        .register(
            TaskDefinition::new("daily_health_report", "Daily Health Report", ScheduleSpec::Daily { hour: 8, minute: 0 }),
            recorder.clone(),
        )
        .unwrap();
    let handle = engine.handle();

    let started = engine.tick_at(clock.now());
    assert_eq!(started, vec![("daily_health_report".to_string(), RunTrigger::CatchUp)]);
    wait_idle(&handle, "daily_health_report").await;

    let snap = handle.get("daily_health_report").unwrap();
    assert_eq!(snap.next_run_at, utc(3, 8, 0));
    assert_eq!(snap.run_count, 1);

    clock.advance(chrono::Duration::minutes(1));
    assert!(engine.tick_at(clock.now()).is_empty());
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn downtime_across_several_slots_catches_up_exactly_once() {
    let store = Arc::new(TaskStateStore::in_memory().unwrap());
    let def = || TaskDefinition::new("daily_backup", "Daily Backup", ScheduleSpec::Daily { hour: 2, minute: 0 });

    // First process: ran on the 1st, then went down.
    let clock = Arc::new(ManualClock::new(utc(1, 2, 0)));
    let first = SchedulerEngine::new(&config(), clock.clone()).with_store(store.clone());
    first.register(def(), Recorder::sleeping(0)).unwrap();
    first.tick_at(clock.now());
    wait_idle(&first.handle(), "daily_backup").await;
    first.persist();
    assert_eq!(first.handle().get("daily_backup").unwrap().next_run_at, utc(2, 2, 0));

    // Second process starts on the 4th at 10:00.
    let clock = Arc::new(ManualClock::new(utc(4, 10, 0)));
    let second = SchedulerEngine::new(&config(), clock.clone()).with_store(store);
    let recorder = Recorder::sleeping(0);
    second.register(def(), recorder.clone()).unwrap();
    assert_eq!(second.restore().unwrap(), 1);

    let started = second.tick_at(clock.now());
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].1, RunTrigger::CatchUp);
    wait_idle(&second.handle(), "daily_backup").await;

    let snap = second.handle().get("daily_backup").unwrap();
    assert_eq!(snap.next_run_at, utc(5, 2, 0));
    assert_eq!(snap.run_count, 2);
    assert!(second.tick_at(clock.now()).is_empty());
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_task_never_overlaps_itself() {
    let clock = Arc::new(ManualClock::new(utc(2, 9, 0)));
    let engine = SchedulerEngine::new(&config(), clock.clone());
    let recorder = Recorder::sleeping(150);
    engine
        .register(
            TaskDefinition::new("connection_check", "Connection Check", ScheduleSpec::Interval { every_secs: 1 }),
            recorder.clone(),
        )
        .unwrap();

    for _ in 0..5 {
        engine.tick_at(clock.now());
        clock.advance(chrono::Duration::seconds(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_idle(&engine.handle(), "connection_check").await;

    assert_eq!(recorder.runs.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pool_bounds_concurrent_runs() {
    let clock = Arc::new(ManualClock::new(utc(2, 9, 0)));
    let engine = SchedulerEngine::new(&config(), clock.clone());
    let recorder = Recorder::sleeping(80);
    for i in 0..5 {
        engine
            .register(
                TaskDefinition::new(format!("t{i}"), "t", ScheduleSpec::Interval { every_secs: 3600 }),
                recorder.clone(),
            )
            .unwrap();
    }

    assert_eq!(engine.tick_at(clock.now()).len(), 5);
    let handle = engine.handle();
    for i in 0..5 {
        wait_idle(&handle, &format!("t{i}")).await;
    }
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 5);
    assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn repeated_failures_disable_until_enabled() {
    let clock = Arc::new(ManualClock::new(utc(2, 9, 0)));
    let engine = SchedulerEngine::new(&config(), clock.clone());
    let recorder = Recorder::failing();
    engine
        .register(
            TaskDefinition::new("weekly_optimization", "Weekly Optimization", ScheduleSpec::Interval { every_secs: 60 }),
            recorder.clone(),
        )
        .unwrap();
    let handle = engine.handle();

    for _ in 0..3 {
        engine.tick_at(clock.now());
        wait_idle(&handle, "weekly_optimization").await;
        clock.advance(chrono::Duration::seconds(61));
    }
    let snap = handle.get("weekly_optimization").unwrap();
    assert_eq!(snap.state, TaskState::Disabled);
    assert_eq!(snap.consecutive_failures, 3);
    assert_eq!(snap.last_error.as_deref(), Some("connection refused"));

    clock.advance(chrono::Duration::hours(1));
    assert!(engine.tick_at(clock.now()).is_empty());
    assert!(matches!(
        handle.trigger("weekly_optimization"),
        Err(SchedulerError::TaskDisabled { .. })
    ));

    let snap = handle.enable("weekly_optimization").unwrap();
    assert_eq!(snap.state, TaskState::Idle);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn manual_run_leaves_schedule_alone() {
    let clock = Arc::new(ManualClock::new(utc(2, 12, 0)));
    let engine = SchedulerEngine::new(&config(), clock.clone());
    engine
        .register(
            TaskDefinition::new("daily_health_report", "Daily Health Report", ScheduleSpec::Daily { hour: 8, minute: 0 }),
            Recorder::sleeping(0),
        )
        .unwrap();
    let handle = engine.handle();
    engine.tick_at(clock.now());
    wait_idle(&handle, "daily_health_report").await;
    let before = handle.get("daily_health_report").unwrap().next_run_at;

    let outcome = handle.run_now("daily_health_report").await.unwrap();
    assert!(outcome.is_success());

    let snap = handle.get("daily_health_report").unwrap();
    assert_eq!(snap.next_run_at, before);
    assert_eq!(snap.run_count, 2);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown_and_abandons_stuck_runs() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(utc(2, 9, 0)));
    let engine = SchedulerEngine::new(&config(), clock);
    engine
        .register(
            TaskDefinition::new("backup", "Backup", ScheduleSpec::Interval { every_secs: 60 }),
            Recorder::sleeping(60_000),
        )
        .unwrap();
    let handle = engine.handle();

    let (tx, rx) = watch::channel(false);
    let join = tokio::spawn(engine.run(rx));
    for _ in 0..100 {
        if handle.get("backup").is_some_and(|t| t.state == TaskState::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("engine did not stop")
        .unwrap();

    let snap = handle.get("backup").unwrap();
    assert_eq!(snap.state, TaskState::Idle);
    assert_eq!(snap.last_error.as_deref(), Some("abandoned at shutdown"));
    assert!(matches!(handle.trigger("backup"), Err(SchedulerError::ShuttingDown)));
}

fn shared_store(dir: &tempfile::TempDir) -> Arc<TaskStateStore> {
    Arc::new(TaskStateStore::open(dir.path().join("warden.db")).unwrap())
}

fn daily_backup() -> TaskDefinition {
    TaskDefinition::new("daily_backup", "Daily backup", ScheduleSpec::Daily { hour: 8, minute: 0 })
}

#[tokio::test]
async fn second_process_cannot_overlap_or_overwrite_the_lease_holder() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(utc(2, 8, 5)));
    let recorder = Recorder::sleeping(60_000);

    let daemon = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    daemon.register(daily_backup(), recorder.clone()).unwrap();
    let lease = daemon.acquire_lease().unwrap().expect("store attached");
    daemon.restore().unwrap();
    assert_eq!(daemon.tick_at(clock.now()).len(), 1);
    daemon.persist();
    for _ in 0..100 {
        if recorder.runs.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A second process opening the same file while the daemon is alive.
    let cli = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    cli.register(daily_backup(), recorder.clone()).unwrap();
    assert!(matches!(cli.acquire_lease(), Err(SchedulerError::LeaseHeld { .. })));
    cli.restore().unwrap();
    let handle = cli.handle();
    assert_eq!(handle.get("daily_backup").unwrap().state, TaskState::Running);
    assert!(matches!(
        handle.run_now("daily_backup").await,
        Err(SchedulerError::AlreadyRunning { .. })
    ));
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);

    // Its writes never reach the file.
    handle.disable("daily_backup").unwrap();
    cli.persist();
    let rows = shared_store(&dir).load_all().unwrap();
    assert_eq!(rows[0].state, TaskState::Running);

    daemon.executor().shutdown(Duration::from_millis(100)).await;
    daemon.persist();
    drop(lease);
    let _lease = cli.acquire_lease().unwrap().expect("store attached");
}

#[tokio::test]
async fn lease_of_a_dead_owner_expires_and_its_runs_are_reset() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(utc(2, 8, 5)));
    let store = shared_store(&dir);
    // Left behind by a process that died mid-run without releasing.
    store
        .try_acquire_lease("crashed", 4242, clock.now(), chrono::Duration::seconds(30))
        .unwrap();
    store
        .save_all(&[PersistedTask {
            id: "daily_backup".into(),
            state: TaskState::Running,
            next_run_at: utc(2, 8, 0),
            last_run_at: Some(utc(1, 8, 0)),
            consecutive_failures: 0,
            last_error: None,
            run_count: 3,
            schedule: Some(ScheduleSpec::Daily { hour: 8, minute: 0 }),
        }])
        .unwrap();

    clock.advance(chrono::Duration::seconds(10));
    let early = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    early.register(daily_backup(), Recorder::sleeping(0)).unwrap();
    match early.acquire_lease() {
        Err(SchedulerError::LeaseHeld { pid, .. }) => assert_eq!(pid, 4242),
        other => panic!("expected LeaseHeld, got {:?}", other.map(|g| g.is_some())),
    }

    clock.advance(chrono::Duration::minutes(1));
    let recorder = Recorder::sleeping(0);
    let engine = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    engine.register(daily_backup(), recorder.clone()).unwrap();
    let _lease = engine.acquire_lease().unwrap().expect("store attached");
    engine.restore().unwrap();
    let handle = engine.handle();
    assert_eq!(handle.get("daily_backup").unwrap().state, TaskState::Idle);
    assert_eq!(
        engine.tick_at(clock.now()),
        vec![("daily_backup".to_string(), RunTrigger::CatchUp)]
    );
    wait_idle(&handle, "daily_backup").await;
    assert_eq!(handle.get("daily_backup").unwrap().run_count, 4);
}

#[tokio::test]
async fn restart_under_a_changed_schedule_recomputes_the_due_time() {
    let dir = tempfile::tempdir().unwrap();
    // Monday 2026-03-02 09:00.
    let clock = Arc::new(ManualClock::new(utc(2, 9, 0)));

    let weekly = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    weekly
        .register(
            TaskDefinition::new(
                "backup",
                "Backup",
                ScheduleSpec::Weekly { day: Weekday::Sun, hour: 2, minute: 0 },
            ),
            Recorder::sleeping(0),
        )
        .unwrap();
    assert_eq!(weekly.handle().get("backup").unwrap().next_run_at, utc(8, 2, 0));
    weekly.persist();
    drop(weekly);

    let daily = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    daily
        .register(
            TaskDefinition::new("backup", "Backup", ScheduleSpec::Daily { hour: 2, minute: 0 }),
            Recorder::sleeping(0),
        )
        .unwrap();
    assert_eq!(daily.restore().unwrap(), 1);
    assert_eq!(daily.handle().get("backup").unwrap().next_run_at, utc(3, 2, 0));

    // An unchanged schedule keeps the saved due time.
    daily.persist();
    let again = SchedulerEngine::new(&config(), clock.clone()).with_store(shared_store(&dir));
    again
        .register(
            TaskDefinition::new("backup", "Backup", ScheduleSpec::Daily { hour: 2, minute: 0 }),
            Recorder::sleeping(0),
        )
        .unwrap();
    clock.advance(chrono::Duration::hours(1));
    again.restore().unwrap();
    assert_eq!(again.handle().get("backup").unwrap().next_run_at, utc(3, 2, 0));
}
