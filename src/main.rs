#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wrphub
//!
//! Device-connection gateway for the WRP message fabric.
//!
//! wrphub accepts long-lived WebSocket connections from remote devices, gives
//! each a stable identity, routes WRP messages addressed to a device over the
//! right connection, correlates responses with waiting callers, and exposes a
//! small authenticated REST surface for operators.

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use wrphub::{config::Config, routes, state::AppState};

/// Interval between inactivity sweeps over the device registry.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Device-connection gateway for the WRP message fabric.
#[derive(Parser)]
#[command(name = "wrphub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("wrphub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        "Device policy: {} (max {}, queue {})",
        config.device.duplicate_policy, config.device.max_devices, config.device.queue_size
    );

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set WRPHUB_API_KEY or update config");
    }

    let max_connections = config.server.max_connections;
    let state = AppState::new(config);

    // GUARD: .layer() only applies to routes merged BEFORE the call.
    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: disconnect devices whose pongs have gone quiet
    let sweep_manager = state.manager.clone();
    let sweep_enabled = state.config.device.idle_timeout_secs > 0;
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if sweep_enabled {
                sweep_manager.sweep_inactive();
            }
        }
    });

    // Graceful shutdown: on signal, disconnect every device (ServiceClosing)
    // and wait for the pumps to exit before letting the server drain.
    let shutdown_manager = state.manager.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }

        info!("Shutting down, disconnecting devices...");
        shutdown_manager.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    sweep_task.abort();
    info!("Goodbye");
}
