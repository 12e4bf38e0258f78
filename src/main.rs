use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_gateway::{AdminServer, Config, Gateway, MetricsCollector};

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "API gateway with prefix routing, bounded retries and passive backend health tracking")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting API gateway");

    // Load configuration
    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    // Initialize components
    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);
    let gateway = Arc::new(Gateway::new(&config, metrics.clone())?);

    // Start admin server if enabled
    let admin_task = if config.admin.enabled {
        let admin_server = AdminServer::new(&config.admin, args.config.clone(), gateway.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.start().await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server if enabled
    let metrics_task = if config.metrics.enabled {
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.start_server().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start the proxy listener
    let host = config.server.host.clone();
    let port = config.server.port;

    let server_task = tokio::spawn(async move {
        if let Err(e) = gateway.start(&host, port).await {
            error!("Server error: {}", e);
        }
    });

    info!("API gateway started successfully");

    // Handle shutdown gracefully
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Proxy listener task exited unexpectedly");
        }
    }

    if let Some(admin_task) = admin_task {
        admin_task.abort();
    }

    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    info!("API gateway shutdown complete");
    Ok(())
}
