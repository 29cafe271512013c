//! Handshake Mining Client - Main Application

use anyhow::Context;
use hs_mining_client::{
    client::{RpcClient, RpcWorkSource},
    config::{BackendType, Config},
    utils::init_logging,
    worker::create_backend,
    Dispatcher, Orchestrator, APP_NAME, APP_VERSION,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config = Config::load().await?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let _log_guard = init_logging(config.log_level, config.log_format, config.log_file.as_deref())
        .context("initializing logging")?;

    let orchestrator = build(&config)?;

    let shutdown = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            shutdown.stop();
        }
    });

    match orchestrator.run().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(category = e.category(), "Miner exited: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Wire the backend, work source and orchestrator from the configuration
fn build(config: &Config) -> anyhow::Result<Orchestrator> {
    let backend = create_backend(config).context("creating backend")?;

    let supported: Vec<String> = BackendType::SUPPORTED
        .iter()
        .map(ToString::to_string)
        .collect();

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        network = %config.network,
        backend = backend.name(),
        devices = backend.device_count(),
        device = ?config.device,
        supported = %supported.join(", "),
        "Miner params"
    );

    let rpc = RpcClient::new(
        config.rpc_url(),
        config.user.clone(),
        config.pass.clone(),
        config.http_timeout_duration(),
    )
    .context("creating RPC client")?;
    info!(url = %rpc.url(), "Node");

    let source = Arc::new(RpcWorkSource::new(rpc));
    let dispatcher = Dispatcher::new(backend, config.params(), config.device);

    Ok(Orchestrator::new(
        config.network,
        config.poll_interval,
        source,
        dispatcher,
    ))
}

/// Print current configuration
fn print_configuration(config: &Config) -> anyhow::Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
