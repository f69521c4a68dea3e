//! Connector binary entrypoint: loads configuration, wires up logging, and
//! runs a `ConnectorNode` until interrupted.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use ilp_connector::{Config, ConnectorNode};
use ilp_settlement::{SettlementError, SettlementExecutor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// The settlement engine itself (an HTTP call to `settlement-engines`, an
/// on-chain transaction, etc.) is out of scope; this logs the attempt and
/// always succeeds so the threshold state machine has something concrete to
/// drive when run standalone.
struct LoggingSettlementExecutor;

#[async_trait]
impl SettlementExecutor for LoggingSettlementExecutor {
    async fn execute(&self, peer_id: &str, token_id: &str, amount: u64, asset_scale: u8) -> Result<(), SettlementError> {
        info!(peer_id, token_id, amount, asset_scale, "settlement executor invoked (no-op implementation)");
        Ok(())
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<(), ilp_connector::NodeError> {
    let config_path = env::args().nth(1).unwrap_or_else(|| "ilp-connector.yml".to_owned());
    let yaml = std::fs::read_to_string(&config_path)
        .map_err(|e| ilp_connector::NodeError::InvalidConfig(format!("cannot read {config_path}: {e}")))?;
    let config = Config::from_str(&yaml)?;
    init_tracing(&config);

    let node = ConnectorNode::new(config, Arc::new(LoggingSettlementExecutor)).await?;
    node.start().await?;
    info!("ilp-connectord started");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    info!("shutdown signal received, draining in-flight requests");
    node.stop().await?;
    info!("ilp-connectord stopped cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ilp-connectord exited with an error");
            ExitCode::FAILURE
        }
    }
}
