//! Round miner - main application

use pow_race_miner::{
    config::Config,
    engine,
    utils::{format_bytes, format_duration, format_hash_rate, init_logging},
    work_source::RpcWorkSource,
    worker, Error, Result, RoundCoordinator, VerificationTable, APP_DESCRIPTION, APP_NAME,
    APP_VERSION,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    // Handle special commands
    if config.info {
        print_info();
        return Ok(());
    }

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(
        config.log_level.as_filter(),
        config.log_format,
        config.log_file.as_deref(),
    )?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: engine={}, devices={:?}, node={}",
        config.engine, config.devices, config.rpc_host
    );

    if let Err(e) = run(config).await {
        error!(category = e.category(), "Miner stopped: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let table = VerificationTable::load(&config.table_path)?;
    info!("Verification table: {}", format_bytes(table.len()));

    let factory = engine::factory_for(config.engine, config.kernel_path.as_deref())?;
    let workers =
        worker::initialize_workers(factory.as_ref(), &config.devices, &table, config.batch_size)?;
    info!("{} of {} devices ready", workers.len(), config.devices.len());

    let source = Arc::new(RpcWorkSource::new(config.rpc_config()?)?);
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut coordinator = RoundCoordinator::new(source, workers, config.coordinator_config());
    let stats = coordinator.run(shutdown).await?;

    info!(
        "Mined {} rounds in {}: {} solutions, {} accepted, {} rejected, average {}",
        stats.rounds,
        format_duration(stats.mining_time.as_secs()),
        stats.solutions,
        stats.submissions_accepted,
        stats.submissions_failed,
        format_hash_rate(stats.average_hash_rate())
    );
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing current round");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });
}

/// Print basic program information
fn print_info() {
    println!("{} v{}", APP_NAME, APP_VERSION);
    println!("{}", APP_DESCRIPTION);
    println!(
        "OpenCL support: {}",
        if cfg!(feature = "opencl") { "enabled" } else { "disabled" }
    );
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config).map_err(Error::from)?;
    println!("{}", config_yaml);
    Ok(())
}
