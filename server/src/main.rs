//! Telemetry Relay Server - Main entry point.
//!
//! This binary starts the relay with:
//! - Structured JSON logging, gated by `LOGGING_ENABLED`
//! - A fail-fast check of required secrets before binding
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`telemetry_relay_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! INFLUXDB_TOKEN="token" \
//! COMPETITION_ENDPOINT="https://competition.example.com/ingest" \
//! CLIENT_CERT_BASE64="$(base64 -w0 client.crt)" \
//! CLIENT_KEY_BASE64="$(base64 -w0 client.key)" \
//! LOGGING_ENABLED=true \
//! cargo run --release --bin telemetry-relay-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use telemetry_relay_server::config::Config;
use telemetry_relay_server::routes::{create_router, AppState};

/// Default filter when diagnostic logging is enabled.
const VERBOSE_FILTER: &str = "info,tower_http=debug,axum::rejection=trace";

/// Default filter otherwise.
const QUIET_FILTER: &str = "warn";

#[tokio::main]
async fn main() -> ExitCode {
    init_logging(Config::logging_enabled_from_env());

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  INFLUXDB_TOKEN        - API token for the time-series store");
            eprintln!("  COMPETITION_ENDPOINT  - URL competition payloads are forwarded to");
            eprintln!("  CLIENT_CERT_BASE64    - Base64-encoded PEM client certificate");
            eprintln!("  CLIENT_KEY_BASE64     - Base64-encoded PEM client private key");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                  - HTTP server port (default: 8080)");
            eprintln!("  LOGGING_ENABLED       - Enable diagnostic logging ('true')");
            eprintln!("  INFLUXDB_HOST         - Time-series store base URL");
            eprintln!("  INFLUXDB_DATABASE     - Time-series database name");
            eprintln!("  TRANSMIT_COMP_DATA    - Start with competition forwarding on ('true')");
            eprintln!("  RUST_LOG              - Log level filter (overrides LOGGING_ENABLED)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        influxdb_host = %config.influxdb_host,
        influxdb_database = %config.influxdb_database,
        transmit_comp_data = config.transmit_comp_data,
        "Telemetry relay starting"
    );

    let port = config.port;
    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to initialize server");
            eprintln!("Error: {err}");
            return ExitCode::from(1);
        }
    };

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// `RUST_LOG` always wins. Without it, `logging_enabled` picks between the
/// verbose filter, which includes validation rejections, and warnings only.
fn init_logging(logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if logging_enabled {
            VERBOSE_FILTER
        } else {
            QUIET_FILTER
        })
    });

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
