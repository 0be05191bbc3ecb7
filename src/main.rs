//! agentmesh connector node entrypoint.
//!
//! Loads configuration, runs the environment-gated validation, starts the
//! node (peer listener, dials, health endpoint, settlement worker), and
//! shuts down gracefully on SIGTERM/SIGINT.

mod address;
mod chain;
mod claim;
mod codec;
mod condition;
mod config;
mod forwarder;
mod handler;
mod http;
mod ledger;
mod node;
mod routing;
mod session;
mod settlement;
mod timestamp;
mod types;
mod util;

use dotenvy::dotenv;

use crate::config::NodeConfig;
use crate::node::Node;
use crate::util::{SigDown, Telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = NodeConfig::load()?;
    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(field = %warning.field, reason = %warning.reason, "config warning");
            }
        }
        Err(e) => {
            if let config::ConfigError::Validation { field, reason } = &e {
                tracing::error!(field = %field, reason = %reason, "invalid configuration");
            } else {
                tracing::error!(error = %e, "invalid configuration");
            }
            std::process::exit(1);
        }
    }

    let node = Node::start(config).await?;

    let sig_down = SigDown::try_new()?;
    sig_down.cancellation_token().cancelled().await;
    node.stop().await;

    Ok(())
}
