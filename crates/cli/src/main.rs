//! Pod Autoscale Predictor CLI
//!
//! A command-line tool for checking predictor health, reading the
//! current prediction and watching the value served to KEDA.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{predict, status};
use std::time::Duration;

/// Pod Autoscale Predictor CLI
#[derive(Parser)]
#[command(name = "ppctl")]
#[command(author, version, about = "CLI for the Pod Autoscale Predictor", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via PPCTL_API_URL env var)
    #[arg(long, env = "PPCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show service readiness and component health
    Health,

    /// Show the current replica prediction
    Predict {
        /// Ask the service for an immediate refresh first
        #[arg(long)]
        refresh: bool,

        /// Include the feature vector behind the prediction
        #[arg(long)]
        features: bool,
    },

    /// Show the external metric served to KEDA
    Keda,

    /// Show the latest value of every collected series
    Metrics,

    /// Poll the external metric and print one line per poll
    Watch {
        /// Seconds between polls
        #[arg(long, short)]
        interval: Option<u64>,

        /// Stop after this many polls
        #[arg(long, short)]
        count: Option<u64>,
    },
}

const DEFAULT_WATCH_INTERVAL_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    // Initialize client
    let client = client::ApiClient::new(&config.api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Health => {
            let ready = status::show_health(&client, cli.format).await?;
            if !ready {
                std::process::exit(1);
            }
        }
        Commands::Predict { refresh, features } => {
            predict::show_prediction(&client, refresh, features, cli.format).await?;
        }
        Commands::Keda => {
            predict::show_scaler_metric(&client, cli.format).await?;
        }
        Commands::Metrics => {
            status::show_metrics(&client, cli.format).await?;
        }
        Commands::Watch { interval, count } => {
            let secs = interval
                .or(config.watch_interval_secs)
                .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS)
                .max(1);
            predict::watch(&client, Duration::from_secs(secs), count, cli.format).await?;
        }
    }

    Ok(())
}
