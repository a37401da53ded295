use edge_gateway::{Config, Gateway};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::fmt().with_max_level(Level::INFO).init();
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    // Initialize logging
    let level = config.gateway.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let gateway = match Gateway::start(&config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            return;
        }
    };
    info!(
        "Gateway '{}' running with modules {:?}.",
        gateway.identity().name(),
        gateway.running_modules()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    gateway.shutdown().await;
    info!("All services shut down successfully.");
}
