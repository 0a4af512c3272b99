//! cohort node process.
//!
//! Loads `NodeConfig` from the environment (`COHORT_CONFIG`,
//! `COHORT_NODE_ID`, `COHORT_REGION`, `COHORT_BIND_ADDR`, `COHORT_NATS_URL`),
//! starts every component and serves WebSocket sessions until Ctrl-C or a
//! fatal store failure.

use std::process::ExitCode;
use std::sync::Arc;

use cohort_core::{CoreService, NodeConfig};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting cohort node {} in {} on {}",
        config.node_id, config.region, config.bind_addr
    );
    match &config.store.nats {
        Some(nats) => info!("Coordination store on NATS at {}", nats.url),
        None => info!("Coordination store in-process; this node will not see other processes"),
    }

    let service = match CoreService::new(config).await {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to build node: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = service.start().await {
        error!("Failed to start node: {e}");
        return ExitCode::FAILURE;
    }

    let server = service.server();
    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Session server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        reason = service.fatal() => {
            error!("Shutting down after fatal failure: {reason}");
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            ExitCode::SUCCESS
        }
    };

    service.shutdown().await;
    code
}
