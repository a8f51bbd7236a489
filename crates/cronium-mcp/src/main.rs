//! `cronium-mcp` entry point.
//!
//! Serves MCP over stdio and HTTP by default (`CRONIUM_TRANSPORT` picks one
//! or both). The HTTP listener also carries the `/terminal` WebSocket.

use cronium_mcp::{http, CroniumConfig, CroniumServer, TransportMode};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() -> anyhow::Result<()> {
    // stdout belongs to the stdio transport
    let filter = EnvFilter::from_default_env()
        .add_directive("cronium_mcp=info".parse()?)
        .add_directive("cronium_ssh=info".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn spawn_http(
    server: CroniumServer,
    config: &CroniumConfig,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let addr = config.http_addr;
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = http::serve(server, addr, stop).await {
            tracing::error!(%addr, error = %e, "HTTP transport failed");
        }
    })
}

fn spawn_stdio(server: CroniumServer, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let service = match server.serve(stdio()).await {
            Ok(service) => service,
            Err(e) => {
                tracing::error!(error = %e, "Stdio transport failed to start");
                return;
            }
        };
        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Stdio transport failed");
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Stdio transport stopping");
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let config = CroniumConfig::from_env();
    config.validate()?;
    tracing::info!(?config, "Starting cronium-mcp");

    let server = CroniumServer::new(config.clone());
    server.start_pool();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut transports = Vec::new();
    if config.transport_mode.http_enabled() {
        transports.push(spawn_http(server.clone(), &config, &shutdown_tx));
    }
    if config.transport_mode.stdio_enabled() {
        transports.push(spawn_stdio(server.clone(), &shutdown_tx));
    }

    let mode = match config.transport_mode {
        TransportMode::Both => "stdio + HTTP",
        TransportMode::Http => "HTTP",
        TransportMode::Stdio => "stdio",
    };
    tracing::info!(mode, http_addr = %config.http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    server.shutdown_pool().await;
    for transport in transports {
        let _ = transport.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
