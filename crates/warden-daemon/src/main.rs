use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use warden_core::clock::SystemClock;
use warden_core::config::WardenConfig;
use warden_core::types::Severity;
use warden_monitor::db::AlertRepository;
use warden_scheduler::db::TaskStateStore;
use warden_scheduler::types::RunOutcome;
use warden_tasks::ShellOps;

mod app;
mod sampler;

use app::{assemble, Collaborators, Runtime, StateAccess};
use sampler::ShellSampler;

#[derive(Parser)]
#[command(name = "warden", version, about = "Database maintenance scheduler and metric alerting daemon")]
struct Cli {
    /// Config file (default: $WARDEN_CONFIG, then ~/.warden/warden.toml).
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and monitor until interrupted (default).
    Run,
    /// Run one task to completion and exit with its outcome.
    Once { task_id: String },
    /// Start a manual run, wait for it and any other run in flight, then exit.
    Trigger { task_id: String },
    /// Print the task table.
    Tasks,
    /// Print a JSON status summary.
    Status,
    /// Print collected metric samples as JSON.
    Metrics {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Print active alerts, optionally filtered by minimum severity.
    Alerts {
        #[arg(long)]
        min_severity: Option<String>,
    },
    /// Disable a task until re-enabled.
    Disable { task_id: String },
    /// Re-enable a disabled task.
    Enable { task_id: String },
    /// Resolve an active alert by id.
    Resolve { alert_id: String },
    /// Delete resolved alerts older than N days.
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "warden_daemon=info,warden_scheduler=info,warden_monitor=info,warden_channels=info,warden_tasks=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    // load config: --config > WARDEN_CONFIG env > ~/.warden/warden.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("WARDEN_CONFIG").ok());
    let config = WardenConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        WardenConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    let task_store = Arc::new(TaskStateStore::new(conn)?);
    let alert_repo = Arc::new(AlertRepository::open(db_path)?);

    let ops = Arc::new(ShellOps::new(config.tasks.commands.clone()));
    // Anything that writes state must own it; queries may run beside a daemon.
    let access = match command {
        Command::Tasks | Command::Status | Command::Metrics { .. } | Command::Alerts { .. } => {
            StateAccess::Shared
        }
        _ => StateAccess::Exclusive,
    };
    let runtime = assemble(
        &config,
        Collaborators {
            clock: Arc::new(SystemClock),
            sampler: Arc::new(ShellSampler::new(&config.monitor.metrics)),
            db: ops.clone(),
            reports: ops,
            task_store: Some(task_store),
            alert_repo: Some(alert_repo),
        },
        access,
    )?;

    let notify_grace = Duration::from_secs(config.scheduler.cancel_grace_secs.max(1));
    match command {
        Command::Run => run(runtime, config.monitor.enabled, notify_grace).await,
        Command::Once { task_id } => {
            let outcome = runtime.app.run_now(&task_id).await;
            runtime.scheduler.persist();
            runtime.workers.shutdown(notify_grace).await;
            match outcome? {
                RunOutcome::Succeeded { message } => {
                    println!("{task_id}: ok{}", message.map(|m| format!(" ({m})")).unwrap_or_default());
                    Ok(())
                }
                RunOutcome::Failed(failure) => anyhow::bail!("{task_id}: failed: {failure}"),
            }
        }
        Command::Trigger { task_id } => {
            let run_id = runtime.app.trigger(&task_id)?;
            println!("{task_id}: started run {run_id}");
            let grace = Duration::from_secs(config.scheduler.task_timeout_secs);
            runtime.scheduler.executor().shutdown(grace).await;
            runtime.scheduler.persist();
            runtime.workers.shutdown(notify_grace).await;
            if let Some(t) = runtime.app.list_tasks().into_iter().find(|t| t.id == task_id) {
                match t.last_error {
                    Some(e) if t.consecutive_failures > 0 => anyhow::bail!("{task_id}: failed: {e}"),
                    _ => println!("{task_id}: ok"),
                }
            }
            Ok(())
        }
        Command::Tasks => {
            for t in runtime.app.list_tasks() {
                println!(
                    "{:<28} {:<9} {:<32} next {}  runs {}  failures {}{}",
                    t.id,
                    t.state.to_string(),
                    t.schedule.to_string(),
                    t.next_run_at.format("%Y-%m-%d %H:%M:%S"),
                    t.run_count,
                    t.consecutive_failures,
                    t.last_error.map(|e| format!("  last error: {e}")).unwrap_or_default(),
                );
            }
            Ok(())
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&runtime.app.status())?);
            Ok(())
        }
        Command::Metrics { hours } => {
            println!("{}", serde_json::to_string_pretty(&runtime.app.export_metrics(hours))?);
            Ok(())
        }
        Command::Alerts { min_severity } => {
            let min = match min_severity {
                Some(s) => Some(s.parse::<Severity>().map_err(anyhow::Error::msg)?),
                None => None,
            };
            for a in runtime.app.list_active_alerts(min) {
                println!(
                    "{:<40} {:<8} {}  since {}",
                    a.id,
                    a.severity.to_string(),
                    a.message,
                    a.opened_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Disable { task_id } => {
            let state = runtime.app.disable(&task_id)?;
            runtime.scheduler.persist();
            println!("{task_id}: {state}");
            Ok(())
        }
        Command::Enable { task_id } => {
            let snap = runtime.app.enable(&task_id)?;
            runtime.scheduler.persist();
            println!("{task_id}: {} (next run {})", snap.state, snap.next_run_at);
            Ok(())
        }
        Command::Resolve { alert_id } => {
            let alert = runtime.app.resolve_alert(&alert_id)?;
            runtime.workers.shutdown(notify_grace).await;
            println!("{}: resolved", alert.id);
            Ok(())
        }
        Command::Purge { older_than_days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
            let purged = runtime.app.purge_resolved(cutoff)?;
            println!("purged {purged} resolved alerts");
            Ok(())
        }
    }
}

/// Drive the scheduler and monitor loops until Ctrl-C, then shut both down
/// and drain pending notifications.
async fn run(runtime: Runtime, monitor_enabled: bool, notify_grace: Duration) -> anyhow::Result<()> {
    let Runtime {
        app,
        scheduler,
        monitor,
        workers,
        lease: _lease,
    } = runtime;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let monitor_task = if monitor_enabled {
        Some(tokio::spawn(monitor.run(shutdown_rx)))
    } else {
        info!("monitoring disabled by config");
        None
    };

    let status = app.status();
    info!(
        tasks = status.tasks_total,
        active_alerts = status.alerts.total_active,
        "warden running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler_task.await {
        warn!("scheduler task ended abnormally: {e}");
    }
    if let Some(task) = monitor_task {
        if let Err(e) = task.await {
            warn!("monitor task ended abnormally: {e}");
        }
    }
    workers.shutdown(notify_grace).await;
    info!("warden stopped");
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
