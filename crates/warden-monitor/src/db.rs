use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

use warden_core::types::{Alert, AlertState, Comparison, MetricSample, Severity};

use crate::error::Result;

/// Initialise the monitor schema in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alerts (
            id            TEXT    NOT NULL PRIMARY KEY,
            metric        TEXT    NOT NULL,
            severity      TEXT    NOT NULL,
            message       TEXT    NOT NULL,
            state         TEXT    NOT NULL,   -- active | resolved
            value         REAL    NOT NULL,
            op            TEXT    NOT NULL,   -- gt | ge | lt | le
            boundary      REAL    NOT NULL,
            opened_at     TEXT    NOT NULL,   -- RFC 3339, UTC
            last_seen_at  TEXT    NOT NULL,
            resolved_at   TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_alerts_state ON alerts (state, metric);

        CREATE TABLE IF NOT EXISTS metric_samples (
            metric  TEXT NOT NULL,
            value   REAL NOT NULL,
            at      TEXT NOT NULL    -- RFC 3339, UTC
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// SQLite-backed alert and metric sample history.
pub struct AlertRepository {
    conn: Mutex<Connection>,
}

impl AlertRepository {
    pub fn new(conn: Connection) -> Result<Self> {
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

    /// Insert or overwrite each alert in one transaction.
    pub fn upsert(&self, alerts: &[Alert]) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("alert repository poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO alerts
                 (id, metric, severity, message, state, value, op, boundary,
                  opened_at, last_seen_at, resolved_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                 ON CONFLICT(id) DO UPDATE SET
                    severity=excluded.severity,
                    message=excluded.message,
                    state=excluded.state,
                    value=excluded.value,
                    last_seen_at=excluded.last_seen_at,
                    resolved_at=excluded.resolved_at",
            )?;
            for a in alerts {
                stmt.execute(rusqlite::params![
                    a.id,
                    a.metric,
                    a.severity.to_string(),
                    a.message,
                    a.state.to_string(),
                    a.value,
                    op_name(a.op),
                    a.boundary,
                    a.opened_at.to_rfc3339(),
                    a.last_seen_at.to_rfc3339(),
                    a.resolved_at.map(|d| d.to_rfc3339()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every stored alert, oldest first. Unreadable rows are skipped.
    pub fn load_all(&self) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().expect("alert repository poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, metric, severity, message, state, value, op, boundary,
                    opened_at, last_seen_at, resolved_at
             FROM alerts ORDER BY opened_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawAlert {
                    id: row.get(0)?,
                    metric: row.get(1)?,
                    severity: row.get(2)?,
                    message: row.get(3)?,
                    state: row.get(4)?,
                    value: row.get(5)?,
                    op: row.get(6)?,
                    boundary: row.get(7)?,
                    opened_at: row.get(8)?,
                    last_seen_at: row.get(9)?,
                    resolved_at: row.get(10)?,
                })
            })?
            .filter_map(|r| r.ok())
            .filter_map(|raw| {
                let id = raw.id.clone();
                let parsed = raw.into_alert();
                if parsed.is_none() {
                    warn!(alert_id = %id, "skipping unreadable alert row");
                }
                parsed
            })
            .collect();
        Ok(rows)
    }

    /// Delete resolved alerts resolved before `cutoff`.
    pub fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().expect("alert repository poisoned");
        let n = conn.execute(
            "DELETE FROM alerts WHERE state = 'resolved' AND resolved_at < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Append samples in one transaction.
    pub fn record_samples(&self, samples: &[MetricSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("alert repository poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO metric_samples (metric, value, at) VALUES (?1,?2,?3)")?;
            for s in samples {
                stmt.execute(rusqlite::params![s.metric, s.value, s.at.to_rfc3339()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The newest `limit` samples, oldest first.
    pub fn recent_samples(&self, limit: usize) -> Result<Vec<MetricSample>> {
        let conn = self.conn.lock().expect("alert repository poisoned");
        let mut stmt = conn.prepare(
            "SELECT metric, value, at FROM (
                SELECT rowid, metric, value, at FROM metric_samples
                ORDER BY rowid DESC LIMIT ?1
             ) ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(metric, value, at)| Some(MetricSample::new(metric, value, parse_ts(&at)?)))
            .collect();
        Ok(rows)
    }

    /// Keep only the newest `keep` samples.
    pub fn trim_samples(&self, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().expect("alert repository poisoned");
        let n = conn.execute(
            "DELETE FROM metric_samples WHERE rowid NOT IN (
                SELECT rowid FROM metric_samples ORDER BY rowid DESC LIMIT ?1
             )",
            [keep as i64],
        )?;
        Ok(n)
    }
}

struct RawAlert {
    id: String,
    metric: String,
    severity: String,
    message: String,
    state: String,
    value: f64,
    op: String,
    boundary: f64,
    opened_at: String,
    last_seen_at: String,
    resolved_at: Option<String>,
}

impl RawAlert {
    fn into_alert(self) -> Option<Alert> {
        Some(Alert {
            severity: self.severity.parse::<Severity>().ok()?,
            state: self.state.parse::<AlertState>().ok()?,
            op: self.op.parse::<Comparison>().ok()?,
            opened_at: parse_ts(&self.opened_at)?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            resolved_at: match self.resolved_at {
                Some(s) => Some(parse_ts(&s)?),
                None => None,
            },
            id: self.id,
            metric: self.metric,
            message: self.message,
            value: self.value,
            boundary: self.boundary,
        })
    }
}

fn op_name(op: Comparison) -> &'static str {
    match op {
        Comparison::Gt => "gt",
        Comparison::Ge => "ge",
        Comparison::Lt => "lt",
        Comparison::Le => "le",
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
