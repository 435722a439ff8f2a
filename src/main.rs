// src/main.rs
mod aggregator;
mod chart;
mod config;
mod series;
mod time_range;
mod transport;
mod web;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::{
    aggregator::LoadAggregator,
    chart::{build_charts, load_all},
    transport::HttpTransport,
};

#[derive(Parser)]
#[command(name = "chartload")]
#[command(about = "Batched metric loading for time-series charts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args)]
struct Source {
    /// Chart and endpoint definitions (JSON)
    #[arg(long, default_value = "charts.json")]
    config: String,

    /// Metrics API base URL, overrides the config file
    #[arg(long)]
    base_url: Option<String>,

    /// Basic auth user
    #[arg(long, requires = "password")]
    user: Option<String>,

    #[arg(long, env = "CHARTLOAD_PASSWORD", requires = "user")]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Keep charts refreshed and serve their state over HTTP
    Serve {
        #[command(flatten)]
        source: Source,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Seconds between chart reloads
        #[arg(long, default_value_t = 15)]
        refresh: u64,
    },

    /// Load every chart once and print the result as JSON
    Fetch {
        #[command(flatten)]
        source: Source,

        /// Seconds to wait for each chart
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
}

fn setup(source: Source) -> Result<web::AppState> {
    let cfg = config::load_config(&source.config)?;
    let base_url = cfg.base_url(source.base_url.as_deref())?;
    let auth = source.user.zip(source.password);
    let transport = HttpTransport::new(base_url, cfg.endpoints.clone(), auth)?;

    let charts = build_charts(&cfg.charts, cfg.tz_offset_seconds).context("build charts")?;
    Ok(web::AppState {
        charts: Arc::new(charts),
        aggregator: LoadAggregator::new(Arc::new(transport)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve { source, bind, refresh } => {
            let bind: SocketAddr = bind.parse().context("parse bind addr")?;
            let state = setup(source)?;
            web::serve(state, bind, Duration::from_secs(refresh.max(1))).await?;
        }

        Command::Fetch { source, wait } => {
            let state = setup(source)?;
            let mut receivers: Vec<_> = state.charts.values().map(|c| (c.clone(), c.subscribe())).collect();

            load_all(&state.charts, &state.aggregator);

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
            let mut out = Vec::new();
            for (chart, rx) in receivers.iter_mut() {
                if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                    warn!(chart = %chart.id(), "no response before deadline");
                }
                out.push(chart.snapshot());
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}
