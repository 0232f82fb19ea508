mod daemon;
mod hooks;
mod install;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use calm_config::CalmConfig;
use calm_runtime::DaemonClient;

#[derive(Debug, Parser)]
#[command(
    name = "calm",
    version,
    about = "Local agent memory service: semantic recall, code and commit search, experience learning"
)]
struct Cli {
    /// Explicit config file path; defaults to {calm_dir}/config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the daemon (detached unless --foreground).
    Start {
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        force: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Show daemon status.
    Status,
    /// Invoke a dispatcher operation against the running daemon.
    Call {
        op: String,
        /// JSON arguments object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Hook entry points: O(1) file operations, no daemon required.
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// Write the default config and hook scripts under the calm directory.
    Install,
}

#[derive(Debug, Subcommand)]
enum HookCommands {
    /// Rotate the session id, reset the tool counter, report any orphan.
    SessionStart,
    /// Count one tool call and report whether a check-in is due.
    PreTool,
    /// Acknowledge a check-in by resetting the tool counter.
    CheckIn,
}

fn load_config(cli: &Cli) -> Result<CalmConfig> {
    match &cli.config {
        Some(path) => CalmConfig::load_from(path),
        None => CalmConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Start { foreground, force } => {
            if foreground {
                install_tracing(&config);
                daemon::run_foreground(config).await
            } else {
                daemon::start(&config, force)
            }
        }
        Commands::Stop => daemon::stop(&config).await,
        Commands::Status => daemon::status(&config),
        Commands::Call { op, args } => {
            let args: serde_json::Value = serde_json::from_str(&args)?;
            let client = DaemonClient::new(config.socket_path.clone());
            let result = client.call(&op, args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Hook { command } => {
            let result = match command {
                HookCommands::SessionStart => hooks::session_start(&config).await?,
                HookCommands::PreTool => hooks::pre_tool(&config).await?,
                HookCommands::CheckIn => hooks::check_in(&config).await?,
            };
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Commands::Install => install::run(&config),
    }
}

fn install_tracing(config: &CalmConfig) {
    let filter = EnvFilter::try_from_env("CALM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
