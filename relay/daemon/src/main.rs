//! Relay Daemon - Streaming Inference Relay Server
//!
//! Serves the relay over two listeners:
//! - HTTP: `GET /` health check and `POST /models/inference` (synchronous)
//! - WebSocket: `/models/inference` (streaming, paced, cancelable)
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # With config file
//! relay-daemon --config /etc/inference-relay/relay.toml
//!
//! # Custom listeners and pacing
//! relay-daemon --host 0.0.0.0 --port 8080 --ws-port 8081 --pacing-ms 50
//!
//! # No upstream: echo the last user message back
//! relay-daemon --offline
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod routes;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use relay_core::backend::scripted::ScriptedBackend;
use relay_core::transport::WebSocketServer;
use relay_core::{load_config_from_path, ConfigOverrides, HuggingFaceBackend, UpstreamBackend};

use routes::{build_router, AppState};

/// Relay Daemon - Streaming inference relay
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host for both listeners
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// HTTP port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// WebSocket port
    #[arg(long, value_name = "PORT")]
    ws_port: Option<u16>,

    /// Delay before each streamed unit, in milliseconds
    #[arg(long, value_name = "MS")]
    pacing_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serve without an upstream, echoing the last user message
    #[arg(long)]
    offline: bool,
}

impl Args {
    fn overrides(&self, http_addr: &str, ws_addr: &str) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if self.host.is_some() || self.port.is_some() {
            overrides = overrides.with_http_addr(with_host_port(
                http_addr,
                self.host.as_deref(),
                self.port,
            ));
        }
        if self.host.is_some() || self.ws_port.is_some() {
            overrides = overrides.with_ws_addr(with_host_port(
                ws_addr,
                self.host.as_deref(),
                self.ws_port,
            ));
        }
        if let Some(ms) = self.pacing_ms {
            overrides = overrides.with_pacing_delay_ms(ms);
        }
        overrides
    }
}

/// Replace the host and/or port of a `host:port` address
fn with_host_port(addr: &str, host: Option<&str>, port: Option<u16>) -> String {
    let (current_host, current_port) = addr.rsplit_once(':').unwrap_or((addr, ""));
    let host = host.unwrap_or(current_host);
    match port {
        Some(port) => format!("{host}:{port}"),
        None => format!("{host}:{current_port}"),
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Shutdown flag shared by both listeners
#[derive(Default)]
struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    let overrides = args.overrides(&config.server.http_addr, &config.server.ws_addr);
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        models = config.allowed_models.len(),
        pacing_ms = config.pacing_delay.as_millis(),
        "Configuration loaded"
    );
    let config = config.into_shared();

    let backend: Arc<dyn UpstreamBackend> = if args.offline {
        info!("Offline mode: echoing requests without an upstream");
        Arc::new(ScriptedBackend::echo())
    } else {
        let backend = HuggingFaceBackend::from_config(&config.upstream)?;
        if !backend.health_check().await {
            warn!(url = %config.upstream.base_url, "Upstream health check failed, continuing");
        }
        Arc::new(backend)
    };

    let http_listener = TcpListener::bind(&config.server.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.server.http_addr))?;
    let ws_listener = TcpListener::bind(&config.server.ws_addr)
        .await
        .with_context(|| {
            format!("Failed to bind WebSocket listener on {}", config.server.ws_addr)
        })?;

    // Setup signal handlers
    let shutdown = Arc::new(Shutdown::default());
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.trigger();
    });

    let router = build_router(AppState {
        config: Arc::clone(&config),
        backend: Arc::clone(&backend),
    });
    info!(addr = %config.server.http_addr, "HTTP listening");

    let http_shutdown = Arc::clone(&shutdown);
    let http = async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move { http_shutdown.wait().await })
            .await
            .context("HTTP server failed")
    };

    let ws_server = WebSocketServer::new(Arc::clone(&config), backend);
    let ws = ws_server.serve(ws_listener, shutdown.wait());

    let (result, ()) = tokio::join!(http, ws);

    info!("Shutting down...");

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_with_host_port() {
        assert_eq!(
            with_host_port("127.0.0.1:9999", Some("0.0.0.0"), None),
            "0.0.0.0:9999"
        );
        assert_eq!(
            with_host_port("127.0.0.1:9999", None, Some(8080)),
            "127.0.0.1:8080"
        );
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "relay-daemon",
            "--host",
            "0.0.0.0",
            "--ws-port",
            "7000",
            "--pacing-ms",
            "25",
        ])
        .unwrap();

        let overrides = args.overrides("127.0.0.1:9999", "127.0.0.1:9998");
        assert_eq!(overrides.http_addr.as_deref(), Some("0.0.0.0:9999"));
        assert_eq!(overrides.ws_addr.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(overrides.pacing_delay_ms, Some(25));
        assert!(!args.offline);
    }

    #[test]
    fn test_no_overrides_by_default() {
        let args = Args::try_parse_from(["relay-daemon"]).unwrap();
        let overrides = args.overrides("127.0.0.1:9999", "127.0.0.1:9998");
        assert!(overrides.http_addr.is_none());
        assert!(overrides.ws_addr.is_none());
        assert!(overrides.pacing_delay_ms.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_late_waiters() {
        let shutdown = Shutdown::default();
        shutdown.trigger();
        shutdown.wait().await;
    }
}
