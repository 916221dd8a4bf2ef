//! Confluence engine - multi-source signal aggregation and position execution
//!
//! # WARNING
//! - This engine trades with real money. Only use funds you can afford to lose.
//! - Exits are best-effort; a fast rug can gap through any stop loss.
//! - Run with `start --dry-run` first.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use confluence_sniper::cli::commands;
use confluence_sniper::config::Config;

/// Confluence engine
#[derive(Parser)]
#[command(name = "confluence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "confluence.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Start {
        /// Simulate fills instead of trading
        #[arg(long)]
        dry_run: bool,
    },

    /// Show risk ledger, positions and allocations
    Status,

    /// Engage or reset the kill switch of the running engine
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(Subcommand)]
enum KillSwitchAction {
    /// Block all new entries
    Engage {
        #[arg(long)]
        reason: String,
    },

    /// Allow new entries again
    Reset {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("confluence_sniper=info".parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_tracing(cli.json_logs || config.logging.json)?;

    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Status => commands::status(&config).await,
        Commands::KillSwitch { action } => match action {
            KillSwitchAction::Engage { reason } => {
                commands::kill_switch_engage(&config, &reason).await
            }
            KillSwitchAction::Reset { force } => commands::kill_switch_reset(&config, force).await,
        },
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
