//! chainbill daemon and operations CLI.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chainbill_core::Config;

#[derive(Parser)]
#[command(name = "chainbill", version, about = "Recurring-payment engine for on-chain subscriptions")]
struct Cli {
    /// Path to a TOML config file; falls back to CHAINBILL_CONFIG and the
    /// default locations.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending database migrations
    Migrate,

    /// Run the workers: timer dispatcher, order consumers, webhook delivery
    Serve {
        /// Number of concurrent order consumers
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    init_tracing(&config);

    match cli.command {
        Commands::Migrate => commands::migrate::run(&config).await,
        Commands::Serve { workers } => commands::serve::run(config, workers).await,
    }
}
