use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dockyard::config::{DEFAULT_CONFIG_FILE, DockyardConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(version, about = "Development container lifecycle engine")]
pub struct Cli {
    /// Path to dockyard.toml
    #[arg(short, long, global = true, env = "DOCKYARD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API, WebSocket event stream and background loops
    Serve {
        /// Address to bind (overrides [server].host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Align the store with the container runtime once and exit
    Reconcile {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Write a default dockyard.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    dockyard::logging::init(cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Serve { host, port } => {
            let config = DockyardConfig::resolve(&cli.config)?;
            cmd::cmd_serve(config, host.clone(), *port).await?;
        }
        Commands::Reconcile { json } => {
            let config = DockyardConfig::resolve(&cli.config)?;
            cmd::cmd_reconcile(config, *json).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
