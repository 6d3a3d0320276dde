//! Agent Forge server entry point.

use agent_forge::agents::AgentStore;
use agent_forge::api::{ApiState, start_http_server};
use agent_forge::broadcast::{BroadcastBus, BusLayer};
use agent_forge::lifecycle::Lifecycle;
use agent_forge::media::MediaStager;
use agent_forge::monitor::StatusMonitor;
use agent_forge::registry::Registry;
use agent_forge::router::ConnectorRouter;
use agent_forge::store::ForgeStore;
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Database filename, kept next to the config file.
const DB_FILENAME: &str = "agent_forge.db";

const STARTER_CONFIG: &str = r#"# Agent Forge configuration

[server]
host = "0.0.0.0"
port = 8080

[defaults]
max_agents_per_project = 5
claude_command = "claude"
poll_interval_seconds = 3.0

# [projects.myproject]
# path = "~/code/myproject"
# default_branch = "main"

# [connectors.telegram]
# type = "telegram"
# [connectors.telegram.credentials]
# bot_token = "..."
"#;

#[derive(Parser)]
#[command(name = "forge", version)]
#[command(about = "Supervise coding-agent terminal sessions across projects and chat platforms")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "forge.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server in the foreground (default)
    Start,
    /// Write a starter config file and exit
    Init,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Init => cmd_init(&cli.config),
        Command::Start => {
            let runtime = tokio::runtime::Runtime::new().context("failed to build runtime")?;
            runtime.block_on(run_server(cli.config, cli.debug))
        }
    }
}

fn cmd_init(config_path: &std::path::Path) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }
    std::fs::write(config_path, STARTER_CONFIG)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("Wrote starter config to {}", config_path.display());
    Ok(())
}

async fn run_server(config_path: PathBuf, debug: bool) -> anyhow::Result<()> {
    let bus = Arc::new(BroadcastBus::new());

    let default_filter = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BusLayer::new(bus.clone()))
        .init();

    let registry = Arc::new(Registry::load(&config_path)?);
    let config = registry.config();
    let bind: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server host/port")?;

    let db_path = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default()
        .join(DB_FILENAME);
    let store = ForgeStore::open(&db_path).await?;

    let agents = Arc::new(AgentStore::new());
    let lifecycle = Arc::new(Lifecycle::new(
        registry.clone(),
        agents,
        store.clone(),
        config.server.port,
    ));
    let router = ConnectorRouter::new(registry.clone(), lifecycle.clone(), MediaStager::default());

    // Adopt any agent sessions left running by a previous server.
    lifecycle.recover_sessions().await;

    router.start().await;

    let monitor = Arc::new(StatusMonitor::new(
        registry.clone(),
        lifecycle.agents().clone(),
        store.clone(),
        bus.clone(),
        router.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let state = Arc::new(ApiState {
        registry,
        lifecycle,
        router: router.clone(),
        store,
        bus,
        started_at: chrono::Utc::now(),
    });
    let server_task = start_http_server(bind, state, shutdown_rx).await?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    router.stop().await;
    let _ = monitor_task.await;
    let _ = server_task.await;
    tracing::info!("agent forge shut down (agents left running)");
    Ok(())
}
