//! [`DatabaseOps`] and [`ReportOps`] backed by operator-supplied shell
//! commands (`[tasks.commands]`).
//!
//! Placeholders substituted before the command runs:
//!
//! | placeholder | value |
//! |---|---|
//! | `{path}` | backup file to write |
//! | `{dir}`  | report output directory |
//! | `{days}` | performance report window |
//!
//! Child processes are killed when the run is cancelled.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

use warden_core::config::TaskCommands;

use crate::error::{OpsError, Result};
use crate::ops::{DatabaseOps, ReportOps, TableResult};

#[derive(Debug, Clone)]
pub struct ShellOps {
    commands: TaskCommands,
}

impl ShellOps {
    pub fn new(commands: TaskCommands) -> Self {
        Self { commands }
    }

}

fn configured<'a>(command: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or(OpsError::NotConfigured(name))
}

/// Run `command` through `sh -c` and return its trimmed stdout.
pub async fn run_shell(command: &str) -> Result<String> {
    debug!(command, "running shell command");
    let out = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| OpsError::Launch {
            command: command.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if out.status.success() {
        Ok(stdout)
    } else {
        Err(OpsError::CommandFailed {
            command: command.to_string(),
            code: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter()
        .fold(template.to_string(), |acc, (k, v)| acc.replace(k, v))
}

/// One `<table> <status>` pair per line; `OK` (any case) is success.
fn parse_optimize_output(stdout: &str) -> Result<Vec<TableResult>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(table), Some(status)) => Ok(TableResult {
                    table: table.to_string(),
                    ok: status.eq_ignore_ascii_case("ok"),
                }),
                _ => Err(OpsError::BadOutput(format!("expected `<table> <status>`, got `{line}`"))),
            }
        })
        .collect()
}

/// The report path is the last non-empty stdout line.
fn report_path(stdout: &str) -> Result<PathBuf> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| OpsError::BadOutput("report command printed no path".into()))
}

#[async_trait]
impl DatabaseOps for ShellOps {
    async fn backup(&self, dest: &Path) -> Result<()> {
        let template = configured(&self.commands.backup, "backup command")?;
        let dest = dest.to_string_lossy();
        run_shell(&substitute(template, &[("{path}", &dest)])).await?;
        Ok(())
    }

    async fn optimize_tables(&self) -> Result<Vec<TableResult>> {
        let command = configured(&self.commands.optimize, "optimize command")?;
        parse_optimize_output(&run_shell(command).await?)
    }

    async fn test_connection(&self) -> Result<bool> {
        let command = configured(&self.commands.health_check, "health check command")?;
        match run_shell(command).await {
            Ok(_) => Ok(true),
            Err(OpsError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ReportOps for ShellOps {
    async fn health_report(&self, out_dir: &Path) -> Result<PathBuf> {
        let template = configured(&self.commands.health_report, "health report command")?;
        let dir = out_dir.to_string_lossy();
        report_path(&run_shell(&substitute(template, &[("{dir}", &dir)])).await?)
    }

    async fn performance_report(&self, out_dir: &Path, days: u32) -> Result<PathBuf> {
        let template = configured(&self.commands.performance_report, "performance report command")?;
        let dir = out_dir.to_string_lossy();
        let days = days.to_string();
        report_path(&run_shell(&substitute(template, &[("{dir}", &dir), ("{days}", &days)])).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(commands: TaskCommands) -> ShellOps {
        ShellOps::new(commands)
    }

    #[test]
    fn optimize_output_parses_status_per_table() {
        let parsed = parse_optimize_output("orders OK\n\nusers  error\nlogs ok\n").unwrap();
        assert_eq!(
            parsed,
            vec![
                TableResult { table: "orders".into(), ok: true },
                TableResult { table: "users".into(), ok: false },
                TableResult { table: "logs".into(), ok: true },
            ]
        );
        assert!(parse_optimize_output("orders").is_err());
    }

    #[test]
    fn report_path_is_last_line() {
        assert_eq!(
            report_path("rendering...\n/tmp/r/health.html\n").unwrap(),
            PathBuf::from("/tmp/r/health.html")
        );
        assert!(report_path("  \n").is_err());
    }

    #[tokio::test]
    async fn unconfigured_command_is_reported() {
        let err = ops(TaskCommands::default()).backup(Path::new("/tmp/x.sql")).await.unwrap_err();
        assert!(matches!(err, OpsError::NotConfigured("backup command")));
    }

    #[tokio::test]
    async fn backup_substitutes_path() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dump.sql");
        let ops = ops(TaskCommands {
            backup: Some("echo dump > '{path}'".into()),
            ..Default::default()
        });
        ops.backup(&dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap().trim(), "dump");
    }

    #[tokio::test]
    async fn failing_health_check_means_disconnected() {
        let down = ops(TaskCommands {
            health_check: Some("exit 3".into()),
            ..Default::default()
        });
        assert!(!down.test_connection().await.unwrap());

        let up = ops(TaskCommands {
            health_check: Some("true".into()),
            ..Default::default()
        });
        assert!(up.test_connection().await.unwrap());
    }

    #[tokio::test]
    async fn performance_report_gets_window() {
        let ops = ops(TaskCommands {
            performance_report: Some("echo '{dir}/perf_{days}d.html'".into()),
            ..Default::default()
        });
        let path = ops.performance_report(Path::new("/srv/reports"), 7).await.unwrap();
        assert_eq!(path, PathBuf::from("/srv/reports/perf_7d.html"));
    }

    #[tokio::test]
    async fn failed_command_carries_stderr() {
        let err = run_shell("echo boom >&2; exit 2").await.unwrap_err();
        match err {
            OpsError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
