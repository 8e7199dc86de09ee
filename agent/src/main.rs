//! Agent daemon entry point: loads configuration, wires up tracing, and
//! runs the reconnect-and-heartbeat loop until terminated.

use anyhow::Result;
use clap::Parser;
use fleet_core::config::{Config, LogTarget};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fleetd-agent")]
#[command(about = "Fleet node agent")]
struct Args {
    /// Node name to register as, overriding the configured value.
    #[arg(short, long)]
    node_name: Option<String>,

    /// Controller address (host:port), overriding the configured value.
    #[arg(short, long)]
    controller: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load("fleetd")?;
    if let Some(node_name) = args.node_name {
        config.node_name = node_name;
    }
    if let Some(controller) = args.controller {
        config.controller_address = Some(controller);
    }
    init_tracing(&config);

    info!(node = %config.node_name, "starting fleet agent");

    let agent = fleet_agent::Agent::new(config).await?;

    tokio::select! {
        res = agent.run() => {
            if let Err(e) = res {
                error!(error = %e, "agent loop exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_tracing_filter()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_target {
        LogTarget::Journald | LogTarget::Stderr => {
            subscriber.with_target(false).compact().init();
        }
        LogTarget::StderrFull => {
            subscriber.init();
        }
    }
}
