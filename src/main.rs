mod commands;
mod render;

use std::path::PathBuf;

use alarmd_core::AlarmdConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "alarmd")]
#[command(about = "Watch your calendars and fire their alarms on time")]
struct Cli {
    /// Use this config file instead of ~/.config/alarmd/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon, printing every alarm as it fires
    Run,
    /// List appointments
    Agenda {
        /// First day to show (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        from: Option<String>,

        /// Last day to show (YYYY-MM-DD, defaults to the configured window)
        #[arg(long)]
        to: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the next alarm that will fire
    Next,
    /// Write a default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alarmd=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => AlarmdConfig::config_path()?,
    };

    match cli.command {
        Commands::InitConfig => commands::init_config::run(&config_path),
        Commands::Run => {
            let config = AlarmdConfig::load_from(&config_path)?;
            commands::run::run(config).await
        }
        Commands::Agenda { from, to, json } => {
            let config = AlarmdConfig::load_from(&config_path)?;
            commands::agenda::run(config, from.as_deref(), to.as_deref(), json).await
        }
        Commands::Next => {
            let config = AlarmdConfig::load_from(&config_path)?;
            commands::next::run(config).await
        }
    }
}
