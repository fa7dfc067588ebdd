//! Promotion CLI
//!
//! Operator tool for the promotion engine: runs migrations, raises, approves
//! and cancels promotions, and inspects promotion state.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "promotion")]
#[command(about = "Artifact promotion engine CLI", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promotion_engine=info,promotion_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut engine = promotion_engine::Config::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.database_url {
        engine.database_url = url;
    }
    engine.validate().context("Invalid configuration")?;

    let config = Config {
        engine,
        json: cli.json,
    };

    handle_command(cli.command, &config).await
}
