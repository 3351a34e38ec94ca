//! Guard Orchestrator Server
//!
//! Main entry point for the guard orchestration gateway.
//! Routes guard requests to backend services with health monitoring,
//! circuit breaking and fallback.

use anyhow::{Context, Result};
use clap::Parser;
use guard_orchestrator::{
    config::{Args, OrchestratorConfig},
    handlers::{create_router, AppState},
    orchestrator::Orchestrator,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Telemetry and observability setup
mod telemetry {
    use anyhow::Result;
    use guard_orchestrator::config::OrchestratorConfig;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    /// Initialize tracing and logging
    pub fn init_tracing(config: &OrchestratorConfig) -> Result<()> {
        let log_level = &config.logging.level;
        let log_format = &config.logging.format;

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = match log_format.as_str() {
            "json" => fmt::layer().json().boxed(),
            _ => fmt::layer().pretty().boxed(),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;

        Ok(())
    }
}

/// Graceful shutdown handling
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let config = OrchestratorConfig::load(&args)?;

    // Initialize telemetry
    telemetry::init_tracing(&config)?;

    info!(
        "Starting Guard Orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("Configuration loaded from: {:?}", args.config);
    info!(
        environment = %config.environment,
        production = config.registry.production,
        static_services = config.services.len(),
        "Effective configuration"
    );

    let addr = config.server.socket_addr()?;

    let orchestrator = Arc::new(
        Orchestrator::with_http_dispatcher(config).context("Failed to create orchestrator")?,
    );
    orchestrator
        .init()
        .await
        .context("Failed to initialize orchestrator")?;

    let app = create_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });

    // Start the HTTP server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to server address")?;

    info!("Guard Orchestrator listening on {}", addr);
    info!("Health endpoint: http://{}/health", addr);
    info!("Orchestration endpoint: http://{}/api/v1/orchestrate", addr);

    // Start server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed");

    // Cleanup on shutdown
    info!("Shutting down Guard Orchestrator...");
    orchestrator.shutdown().await;
    info!("Guard Orchestrator shutdown complete");

    served
}
