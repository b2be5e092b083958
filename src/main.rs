use clap::Parser;
use legis_collector::{setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting legis-collector v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args).await?;

    let cli_runner = CliRunner::new(config);

    // Setup graceful shutdown; the runner closes its sessions before returning
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = cli_runner.run(args.command, shutdown_rx).await;
    info!("Application completed");

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("legis-collector stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        Config::default()
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Page size hint: {}, low-water-mark: {}",
        config.queue.page_size_hint,
        config.queue.effective_low_water_mark()
    );
    info!(
        "Handler workers: {}, shared with fetches: {}",
        config.queue.worker_pool_size, config.queue.share_worker_pool
    );
    info!("Session capacity: {}", config.resource_pool.capacity);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
        }

        let _ = shutdown_tx.send(());
    })
}
