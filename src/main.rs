use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tripwire_core::config::AppConfig;
use tripwire_core::event::EventBus;
use tripwire_core::traits::RunStore;
use tripwire_core::types::{FlowId, RunFilter, RunRecord, RunStatus};

use tripwire_engine::{
    read_flow_file, validate, AuditLog, Engine, ExecutorRegistry, Scheduler, SqliteRunStore,
};
use tripwire_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "tripwire", version, about = "Confidence-gated automation and failover engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tripwire.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: scheduler, recovery and the HTTP gateway
    Serve {
        /// Do not start the HTTP gateway
        #[arg(long)]
        no_gateway: bool,
    },
    /// Validate a flow file without admitting it
    Validate {
        /// Flow JSON file (execution or authoring shape)
        file: PathBuf,
    },
    /// List recorded runs of a flow
    Runs {
        /// Flow id
        flow: String,
        /// Only runs with this status (pending, running, awaiting_approval, completed, failed)
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List runs suspended for approval
    Approvals,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tripwire=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tripwire", &mut std::io::stdout());
        return Ok(());
    }

    // Validation needs no config either
    if let Some(Commands::Validate { file }) = &cli.command {
        return validate_file(file);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Runs {
            flow,
            status,
            limit,
        }) => {
            let status = status
                .map(|s| s.parse::<RunStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let store = SqliteRunStore::open(&config.db_path())?;
            let filter = RunFilter {
                status,
                limit: Some(limit),
                ..Default::default()
            };
            let runs = store.list(&FlowId::from_string(&flow), &filter).await?;
            if runs.is_empty() {
                println!("No runs recorded for flow '{}'.", flow);
            }
            for run in &runs {
                print_run(run);
            }
        }
        Some(Commands::Approvals) => {
            let store = SqliteRunStore::open(&config.db_path())?;
            let waiting: Vec<_> = store
                .in_flight()
                .await?
                .into_iter()
                .filter(|cp| cp.record.status == RunStatus::AwaitingApproval)
                .collect();
            if waiting.is_empty() {
                println!("No runs awaiting approval.");
            }
            for cp in &waiting {
                let rec = &cp.record;
                let node = rec.node_results.last();
                println!(
                    "{}  {} v{}  node={}  {}",
                    rec.run_id,
                    rec.flow_id,
                    rec.flow_version,
                    node.map(|n| n.node_id.as_str()).unwrap_or("-"),
                    node.map(|n| n.detail.as_str()).unwrap_or(""),
                );
            }
        }
        Some(Commands::Serve { no_gateway }) => serve(config, !no_gateway).await?,
        None => serve(config, true).await?,
        Some(Commands::Validate { .. }) => unreachable!("handled before config load"),
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn serve(config: AppConfig, with_gateway: bool) -> anyhow::Result<()> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;

    let store = Arc::new(SqliteRunStore::open(&config.db_path())?);
    let event_bus = Arc::new(EventBus::default());
    let registry = ExecutorRegistry::with_builtins(&config);
    info!(executors = ?registry.kinds(), "Action executors registered");
    let engine = Engine::new(&config, store, registry, event_bus.clone());

    let cancel = CancellationToken::new();

    if let Some(log_dir) = config.log_dir() {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let audit = AuditLog::new(log_dir, level);
        tokio::spawn(audit.run(event_bus.clone(), cancel.clone()));
        tokio::task::yield_now().await;
    }

    engine.load_flows(Some(&config.flows_dir())).await?;
    let recovered = engine.recover().await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Resumed runs from checkpoints");
    }

    let scheduler = Scheduler::new(engine.clone(), cancel.clone());
    tokio::spawn(async move {
        scheduler.run().await;
    });

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    if with_gateway {
        let gateway_config = config.gateway.clone().unwrap_or_default();
        let server = GatewayServer::new(gateway_config, engine.clone());
        if let Err(e) = server.run(cancel.clone()).await {
            error!(error = %e, "Gateway server error");
            cancel.cancel();
            return Err(e);
        }
    } else {
        info!("Gateway disabled, engine running");
        cancel.cancelled().await;
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".tripwire").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let flow = read_flow_file(path)?;
    match validate(&flow) {
        Ok(graph) => {
            println!(
                "{} v{}: valid ({} nodes, {} edges)",
                flow.id,
                flow.version,
                flow.nodes.len(),
                flow.edges.len()
            );
            println!("order: {}", graph.order().join(" -> "));
            Ok(())
        }
        Err(errors) => {
            eprintln!("{} v{}: {} problem(s)", flow.id, flow.version, errors.len());
            for e in &errors {
                eprintln!("  - {}", e);
            }
            std::process::exit(1);
        }
    }
}

fn print_run(run: &RunRecord) {
    let failure = match (&run.failure, &run.failure_detail) {
        (Some(reason), Some(detail)) => format!("  {}: {}", reason, truncate(detail, 80)),
        (Some(reason), None) => format!("  {}", reason),
        _ => String::new(),
    };
    println!(
        "{}  v{}  {:<17} {}{}{}",
        run.run_id,
        run.flow_version,
        run.status.as_str(),
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        if run.simulated { "  [simulated]" } else { "" },
        failure,
    );
    for node in &run.node_results {
        println!(
            "    {:<20} {:<17} {}",
            node.node_id,
            node.status.as_str(),
            truncate(&node.detail, 80)
        );
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
