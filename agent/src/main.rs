//! hostagent: runs the agent API or registers this host with the manager

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hostagent::api::{self, AgentState};
use hostagent::command::SystemRunner;
use hostagent::config;
use hostagent::error::StatusCode;
use hostagent::inventory::HostInspector;
use hostagent::register::{self, RegisterInfo};

#[derive(Parser)]
#[command(name = "hostagent", version)]
#[command(about = "Host agent for plugin management and probe configuration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "FILE", env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the agent API
    Start,
    /// Register this host with the manager
    Register(RegisterArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct RegisterArgs {
    /// File holding the registration JSON
    #[arg(short = 'f', long = "path", value_name = "FILE")]
    path: Option<PathBuf>,

    /// Registration JSON given inline
    #[arg(short = 'd', long = "data", value_name = "JSON")]
    data: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::config_path(cli.config.as_deref());
    let config = config::load_config(&config_path)?;
    init_logging(&config.log.level)?;

    match cli.command {
        Commands::Start => {
            info!("hostagent v{} starting", env!("CARGO_PKG_VERSION"));
            let runner = Arc::new(SystemRunner::new(config.command.timeout()));
            let state = Arc::new(AgentState::new(&config, runner));
            api::serve(&config, state).await
        }
        Commands::Register(args) => {
            let parsed = match (args.path, args.data) {
                (Some(path), _) => RegisterInfo::from_file(&path),
                (None, data) => RegisterInfo::from_json(&data.unwrap_or_default()),
            };
            let code = match parsed {
                Ok(info) => {
                    let runner = Arc::new(SystemRunner::new(config.command.timeout()));
                    let os_version = tokio::task::spawn_blocking(move || HostInspector::new(runner).os().os_version)
                        .await
                        .context("Failed to read OS version")?;
                    register::register(&info, &config_path, &os_version).await
                }
                Err(e) => {
                    error!("Invalid registration data: {e}");
                    e.status_code()
                }
            };

            if code == StatusCode::Success {
                println!("Register Success");
                Ok(())
            } else {
                println!("Register Fail");
                std::process::exit(1);
            }
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {level}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {e}"))
}
