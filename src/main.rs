use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use petalguard::config::GuardConfig;
use petalguard::http::HttpServer;
use petalguard::ratelimit::RateLimiter;

#[derive(Debug, Parser)]
#[command(name = "petalguard", version, about = "Adaptive rate limiting for the storefront API")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GuardConfig::load(args.config.as_deref())?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if args.log_json || config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Petalguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        policies = config.rate_limiting.policies.len(),
        fail_open = config.rate_limiting.fail_open,
        "Configuration loaded"
    );

    let rate_limiter = Arc::new(RateLimiter::with_config(&config.rate_limiting)?);
    rate_limiter.start();
    info!("Rate limiter initialized");

    let http_server = HttpServer::new(config.server.http_addr, rate_limiter.clone());

    // Run the server with graceful shutdown on Ctrl+C
    let result = http_server.serve_with_shutdown(shutdown_signal()).await;

    rate_limiter.shutdown();
    result?;

    info!("Petalguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
