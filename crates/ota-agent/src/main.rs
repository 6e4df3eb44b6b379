//! ota-agent binary entry point

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ota_agent::shutdown::wait_for_signal;
use ota_agent::{logging, AgentServer, LogOptions};
use ota_core::{OtaConfig, OtaManager, Shutdown};

#[derive(Parser)]
#[command(name = "ota-agent")]
#[command(about = "OTA update agent - resumable verified downloads and snapshot deploys")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "OTA_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// API listen address (overrides the config file)
    #[arg(long, env = "OTA_AGENT_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Also write daily-rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (default)
    Run,
    /// Install the factory snapshot from an unpacked artifact directory
    ProvisionFactory {
        #[arg(long)]
        from: PathBuf,
    },
    /// Switch back to an earlier snapshot. Stop the agent first.
    Rollback {
        #[arg(long, value_enum, default_value = "previous")]
        to: RollbackTarget,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum RollbackTarget {
    Previous,
    Factory,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = logging::init(&LogOptions {
        level: args.log_level.clone(),
        json: args.json_logs,
        dir: args.log_dir.clone(),
    })?;

    let mut config = match &args.config {
        Some(path) => OtaConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => OtaConfig::default(),
    };
    if let Some(addr) = args.listen_addr {
        config.operation.listen_addr = addr;
    }
    config.validate()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ProvisionFactory { from } => {
            let manager = OtaManager::builder(config).build()?;
            manager.deployer().init()?;
            let snapshot = manager.deployer().provision_factory(&from).await?;
            info!("Factory snapshot provisioned at {}", snapshot.display());
            Ok(())
        }
        Command::Rollback { to } => {
            let manager = OtaManager::builder(config).build()?;
            manager.deployer().init()?;
            match to {
                RollbackTarget::Previous => manager.deployer().rollback_to_previous().await?,
                RollbackTarget::Factory => manager.deployer().rollback_to_factory().await?,
            }
            info!("Rollback complete");
            Ok(())
        }
        Command::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: OtaConfig) -> Result<()> {
    info!("Starting ota-agent");
    let listen_addr = config.operation.listen_addr;

    let shutdown = Shutdown::new();
    let manager = OtaManager::builder(config)
        .with_shutdown(shutdown.signal())
        .build()?;
    manager.start().await.context("startup recovery failed")?;
    info!(
        stage = ?manager.progress().stage,
        "Startup recovery complete"
    );

    let server = AgentServer::new(manager, listen_addr);
    server
        .run(async move {
            wait_for_signal().await;
            shutdown.trigger();
        })
        .await
}
