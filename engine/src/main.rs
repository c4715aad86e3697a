use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use novaadapt_core::{backup, Agent, RunObjectiveRequest, ServerConfig};
use novaadapt_observability::{init_process_logging, ProcessKind};
use novaadapt_providers::Strategy;
use novaadapt_server::{serve, AppState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "novaadapt-engine")]
#[command(about = "Headless novaadapt execution orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server.
    Serve {
        #[arg(long, alias = "host", env = "NOVAADAPT_HOST")]
        hostname: Option<String>,
        #[arg(long, env = "NOVAADAPT_PORT")]
        port: Option<u16>,
        #[arg(long, env = "NOVAADAPT_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Run a single objective to completion and print the resulting plan.
    Run {
        objective: String,
        #[arg(long, default_value = "single")]
        strategy: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Probe configured model endpoints and report reachability.
    Check {
        #[arg(long)]
        model: Vec<String>,
    },
    /// Snapshot every store's database file into the backups directory.
    Backup {
        #[arg(long, env = "NOVAADAPT_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Restore every store from its latest backup (or an explicit one).
    Restore {
        #[arg(long, env = "NOVAADAPT_STATE_DIR")]
        state_dir: Option<String>,
        /// Restore only this store (plans, jobs, audit, idempotency, actions).
        #[arg(long)]
        store: Option<String>,
        /// Explicit backup file to restore from; defaults to the latest
        /// snapshot for the chosen store.
        #[arg(long)]
        from: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = build_config();
    let _guard = init_logging(&config);

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let mut config = config;
            if let Some(hostname) = hostname {
                config.host = hostname.parse().context("invalid hostname")?;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir.into();
            }
            let addr = SocketAddr::new(config.host, config.port);
            let state_dir = config.state_dir.clone();
            let state = AppState::build(config).await?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Run { objective, strategy, model, dry_run } => {
            let state = AppState::build(config).await?;
            let agent = Agent::new(state.router.clone(), state.transport.clone(), state.action_log.clone());
            let request = RunObjectiveRequest {
                objective,
                strategy: Strategy::parse(&strategy)?,
                model_name: model,
                candidate_models: Vec::new(),
                fallback_models: Vec::new(),
                dry_run,
                record_history: true,
                allow_dangerous: false,
                max_actions: 25,
            };
            let outcome = agent.run_objective(request).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "model": outcome.model,
                "model_id": outcome.model_id,
                "strategy": outcome.strategy,
                "actions": outcome.actions,
                "results": outcome.results,
            }))?);
        }
        Command::Backup { state_dir } => {
            let mut config = config;
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir.into();
            }
            let backups_dir = config.backups_dir();
            for (name, path) in store_paths(&config) {
                match backup::snapshot(&path, &backups_dir) {
                    Ok(dest) => println!("{name}: backed up to {}", dest.display()),
                    Err(err) => println!("{name}: skipped ({err})"),
                }
            }
        }
        Command::Restore { state_dir, store, from } => {
            let mut config = config;
            if let Some(state_dir) = state_dir {
                config.state_dir = state_dir.into();
            }
            let backups_dir = config.backups_dir();
            let targets: Vec<(&'static str, std::path::PathBuf)> = match &store {
                Some(name) => store_paths(&config).into_iter().filter(|(n, _)| n == name).collect(),
                None => store_paths(&config),
            };
            if targets.is_empty() {
                anyhow::bail!("unknown store '{}'", store.unwrap_or_default());
            }
            for (name, path) in targets {
                let backup_path = match &from {
                    Some(explicit) if store.is_some() => std::path::PathBuf::from(explicit.as_str()),
                    _ => match backup::latest_backup(&backups_dir, name)? {
                        Some(found) => found,
                        None => {
                            println!("{name}: no backup found, skipping");
                            continue;
                        }
                    },
                };
                let archived = backup::restore(&path, &backup_path)?;
                match archived {
                    Some(archive) => println!(
                        "{name}: restored from {} (previous file archived at {})",
                        backup_path.display(),
                        archive.display()
                    ),
                    None => println!("{name}: restored from {}", backup_path.display()),
                }
            }
        }
        Command::Check { model } => {
            let state = AppState::build(config).await?;
            let names = if model.is_empty() { None } else { Some(model) };
            let report: Vec<novaadapt_wire::CheckResult> = state
                .router
                .health_check(names, "ping")
                .await
                .into_iter()
                .map(|outcome| novaadapt_wire::CheckResult {
                    name: outcome.name,
                    model: outcome.model,
                    provider: outcome.provider,
                    ok: outcome.ok,
                    latency_ms: outcome.latency_ms,
                    preview: outcome.preview,
                    error: outcome.error,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn build_config() -> ServerConfig {
    ServerConfig::from_env()
}

/// The five independent store files backup/restore operate over (spec
/// §4.10/§6): `(stem, path)` pairs where `stem` matches the file name
/// backup/restore use to find the right snapshot.
fn store_paths(config: &ServerConfig) -> Vec<(&'static str, std::path::PathBuf)> {
    vec![
        ("plans", config.plans_db_path()),
        ("jobs", config.jobs_db_path()),
        ("audit", config.audit_db_path()),
        ("idempotency", config.idempotency_db_path()),
        ("actions", config.action_log_db_path()),
    ]
}

fn init_logging(config: &ServerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = config.state_dir.join("logs");
    match init_process_logging(ProcessKind::Engine, &logs_dir, 14) {
        Ok((guard, info)) => {
            info!(logs_dir = %info.logs_dir, "structured logging initialized");
            Some(guard)
        }
        Err(err) => {
            tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
            tracing::warn!(error = %err, "falling back to stderr logging");
            None
        }
    }
}

fn log_startup_paths(state_dir: &std::path::Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| std::path::PathBuf::from("<unknown>"));
    info!("starting novaadapt-engine on http://{addr}");
    info!(
        "startup paths: exe={} state_dir={}",
        exe.display(),
        state_dir.display()
    );
}
