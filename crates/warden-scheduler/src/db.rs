use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use crate::error::Result;
use crate::types::{PersistedTask, ScheduleSpec, TaskState};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `task_state` and `scheduler_lease` tables (idempotent). One
/// `task_state` row per task ID; the definition lives in configuration, only
/// the schedule it was last run under is recorded so a changed schedule can
/// be detected on restore.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_state (
            id                    TEXT    NOT NULL PRIMARY KEY,
            state                 TEXT    NOT NULL,   -- idle | running | disabled
            next_run_at           TEXT    NOT NULL,   -- RFC 3339, UTC
            last_run_at           TEXT,               -- RFC 3339 or NULL
            consecutive_failures  INTEGER NOT NULL DEFAULT 0,
            last_error            TEXT,
            run_count             INTEGER NOT NULL DEFAULT 0,
            updated_at            TEXT    NOT NULL,
            schedule              TEXT                -- ScheduleSpec as JSON
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_lease (
            id            INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
            owner         TEXT    NOT NULL,
            pid           INTEGER NOT NULL,
            heartbeat_at  TEXT    NOT NULL    -- RFC 3339, UTC
        ) STRICT;
        ",
    )?;
    // Databases written before the schedule column existed.
    let has_schedule: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('task_state') WHERE name = 'schedule'",
        [],
        |row| row.get(0),
    )?;
    if !has_schedule {
        conn.execute_batch("ALTER TABLE task_state ADD COLUMN schedule TEXT;")?;
    }
    Ok(())
}

/// The single row recording which process owns the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub pid: u32,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    /// A lease whose heartbeat is younger than `ttl` is still held.
    pub fn is_live(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.heartbeat_at < ttl
    }
}

/// SQLite-backed store for per-task runtime state.
pub struct TaskStateStore {
    conn: Mutex<Connection>,
}

impl TaskStateStore {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Upsert every row in one transaction.
    pub fn save_all(&self, tasks: &[PersistedTask]) -> Result<()> {
        let mut conn = self.conn.lock().expect("task state store poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO task_state
                 (id, state, next_run_at, last_run_at, consecutive_failures,
                  last_error, run_count, updated_at, schedule)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(id) DO UPDATE SET
                    state=excluded.state,
                    next_run_at=excluded.next_run_at,
                    last_run_at=excluded.last_run_at,
                    consecutive_failures=excluded.consecutive_failures,
                    last_error=excluded.last_error,
                    run_count=excluded.run_count,
                    updated_at=excluded.updated_at,
                    schedule=excluded.schedule",
            )?;
            for t in tasks {
                let schedule = t
                    .schedule
                    .as_ref()
                    .and_then(|s| serde_json::to_string(s).ok());
                stmt.execute(rusqlite::params![
                    t.id,
                    t.state.to_string(),
                    t.next_run_at.to_rfc3339(),
                    t.last_run_at.map(|d| d.to_rfc3339()),
                    t.consecutive_failures,
                    t.last_error,
                    t.run_count as i64,
                    now,
                    schedule,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load every stored row. Rows that fail to parse are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<PersistedTask>> {
        let conn = self.conn.lock().expect("task state store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, state, next_run_at, last_run_at, consecutive_failures,
                    last_error, run_count, schedule
             FROM task_state ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // id
                    row.get::<_, String>(1)?,         // state
                    row.get::<_, String>(2)?,         // next_run_at
                    row.get::<_, Option<String>>(3)?, // last_run_at
                    row.get::<_, u32>(4)?,            // consecutive_failures
                    row.get::<_, Option<String>>(5)?, // last_error
                    row.get::<_, i64>(6)?,            // run_count
                    row.get::<_, Option<String>>(7)?, // schedule
                ))
            })?
            .filter_map(|r| {
                let (id, state, next, last, failures, last_error, run_count, schedule) = r.ok()?;
                let parsed = (|| {
                    Some(PersistedTask {
                        state: state.parse::<TaskState>().ok()?,
                        next_run_at: parse_ts(&next)?,
                        last_run_at: match last {
                            Some(s) => Some(parse_ts(&s)?),
                            None => None,
                        },
                        consecutive_failures: failures,
                        last_error,
                        run_count: run_count.max(0) as u64,
                        schedule: match schedule {
                            Some(s) => Some(serde_json::from_str::<ScheduleSpec>(&s).ok()?),
                            None => None,
                        },
                        id: id.clone(),
                    })
                })();
                if parsed.is_none() {
                    warn!(task_id = %id, "skipping unreadable task state row");
                }
                parsed
            })
            .collect();
        Ok(rows)
    }

    /// Drop rows for tasks that are no longer configured.
    pub fn retain(&self, ids: &[String]) -> Result<usize> {
        let conn = self.conn.lock().expect("task state store poisoned");
        let stored: Vec<String> = {
            let mut stmt = conn.prepare("SELECT id FROM task_state")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let mut removed = 0;
        for id in stored.iter().filter(|id| !ids.contains(id)) {
            removed += conn.execute("DELETE FROM task_state WHERE id = ?1", [id])?;
        }
        Ok(removed)
    }

    /// The recorded lease, live or not.
    pub fn current_lease(&self) -> Result<Option<Lease>> {
        let conn = self.conn.lock().expect("task state store poisoned");
        read_lease(&conn)
    }

    /// Take or renew the lease for `owner`.
    ///
    /// Succeeds when no lease is recorded, when the recorded one has gone
    /// `ttl` without a heartbeat, or when `owner` already holds it. Otherwise
    /// the live holder is returned and nothing is written.
    pub fn try_acquire_lease(
        &self,
        owner: &str,
        pid: u32,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Option<Lease>> {
        let mut conn = self.conn.lock().expect("task state store poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(held) = read_lease(&tx)? {
            if held.owner != owner && held.is_live(now, ttl) {
                return Ok(Some(held));
            }
        }
        tx.execute(
            "INSERT INTO scheduler_lease (id, owner, pid, heartbeat_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                owner=excluded.owner,
                pid=excluded.pid,
                heartbeat_at=excluded.heartbeat_at",
            rusqlite::params![owner, pid, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(None)
    }

    /// Drop the lease if `owner` still holds it.
    pub fn release_lease(&self, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("task state store poisoned");
        let n = conn.execute("DELETE FROM scheduler_lease WHERE owner = ?1", [owner])?;
        Ok(n > 0)
    }
}

fn read_lease(conn: &Connection) -> Result<Option<Lease>> {
    let row = conn
        .query_row(
            "SELECT owner, pid, heartbeat_at FROM scheduler_lease WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.and_then(|(owner, pid, heartbeat)| {
        let Some(heartbeat_at) = parse_ts(&heartbeat) else {
            warn!(owner = %owner, "ignoring lease with unreadable heartbeat");
            return None;
        };
        Some(Lease {
            owner,
            pid,
            heartbeat_at,
        })
    }))
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
