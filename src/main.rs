use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mcp_http_wrapper::{
    config::{self, DEFAULT_CONFIG_PATH},
    http::{router, AppState},
    session::{ServerParams, StdioConnector},
    RequestBridge,
};

/// How long shutdown waits for the MCP session to close
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// CLI arguments for the MCP HTTP wrapper
#[derive(Parser, Debug)]
#[command(name = "mcp-http-wrapper")]
#[command(about = "Expose a stdio MCP server over HTTP")]
struct Args {
    /// Path to the TOML config file (optional; defaults apply if missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mcp_http_wrapper=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = config::load_config(&args.config)?;
    let server = config.server;

    tracing::info!("Starting {} HTTP Wrapper on port {}", server.name, server.port);
    tracing::info!("MCP Server: {}", server.command_line());

    let bridge = Arc::new(RequestBridge::new(
        ServerParams::from(&server),
        Arc::new(StdioConnector::new()),
    ));

    let addr: SocketAddr = format!("{}:{}", args.host, server.port).parse()?;
    let app = router(AppState::new(bridge.clone(), server));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if bridge.is_running() {
        tracing::info!("Shutting down, closing MCP session");
        let closed = tokio::task::spawn_blocking(move || {
            bridge.close_session_within(SHUTDOWN_CLOSE_TIMEOUT)
        })
        .await?;
        if let Err(e) = closed {
            tracing::warn!("{}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
