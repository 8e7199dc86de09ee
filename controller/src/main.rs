//! Controller daemon entry point: loads configuration, wires up tracing,
//! and runs the controller until it exits or receives a termination
//! signal.

use anyhow::Result;
use clap::Parser;
use fleet_controller::controller::LogLevelHandle;
use fleet_core::config::{Config, LogTarget};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Parser, Debug)]
#[command(name = "fleetd-controller")]
#[command(about = "Fleet lifecycle controller")]
struct Args {
    /// Port to listen on, overriding the configured value.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load("fleetd")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    let log_handle = init_tracing(&config);

    info!(port = config.port, "starting fleet controller");

    let controller = fleet_controller::controller::Controller::new(config, Some(log_handle)).await?;

    tokio::select! {
        res = Arc::clone(&controller).run() => {
            if let Err(e) = res {
                error!(error = %e, "controller loop exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Builds the filter as a reloadable layer so `SetLogLevel` can swap it
/// at runtime, and returns the handle for that.
fn init_tracing(config: &Config) -> LogLevelHandle {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_tracing_filter()));
    let (filter_layer, handle) = tracing_subscriber::reload::Layer::new(filter);

    let fmt_layer = match config.log_target {
        LogTarget::Journald | LogTarget::Stderr => tracing_subscriber::fmt::layer().with_target(false).compact().boxed(),
        LogTarget::StderrFull => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry().with(filter_layer).with(fmt_layer).init();

    handle
}
