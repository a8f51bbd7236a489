//! HTTP transport: MCP over streamable HTTP plus the terminal WebSocket.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - JSON-RPC requests
//! - `GET /mcp` - SSE stream for server-initiated messages
//! - `GET /terminal` - Interactive shell over WebSocket
//! - `GET /health` - Health check
//! - `GET /` - Server info
//!
//! ## Terminal protocol
//!
//! The first frame is a JSON text frame naming the host
//! (`{"host", "username", "password" | "private_key", "cols", "rows"}`).
//! After that, text frames of the form `{"type":"resize","cols":..,"rows":..}`
//! resize the terminal and every other text or binary frame is typed input.
//! Shell output comes back as binary frames. When the shell exits a final
//! `{"type":"exit","code":..}` text frame is sent.

use crate::server::CroniumServer;
use crate::types::{TerminalControl, TerminalOpenRequest};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use cronium_ssh::{PtySize, ShellEvent, ShellInput};
use futures::{SinkExt, StreamExt};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router for the server.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: CroniumServer) -> Router {
    tracing::debug!("Building HTTP router");

    let session_manager = Arc::new(LocalSessionManager::default());

    let mcp_server = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(mcp_server.clone()),
        session_manager,
        StreamableHttpServerConfig::default(),
    );

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .route("/terminal", get(terminal_handler))
        .with_state(server)
        // MCP endpoint as a fallback/nested service
        .fallback_service(mcp_service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::debug!("HTTP router built with routes: /, /health, /terminal, /mcp");
    router
}

/// Health check endpoint.
async fn health_handler(State(server): State<CroniumServer>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cronium-mcp",
        "poolRunning": server.pool().is_running(),
        "connections": server.pool().size().await,
    }))
}

/// Root endpoint: a short page listing endpoints and tools.
async fn root_handler() -> impl IntoResponse {
    tracing::trace!("Root page request");
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>cronium-mcp</title></head>
<body style="font-family: system-ui; max-width: 720px; margin: 40px auto;">
    <h1>cronium-mcp</h1>
    <p>Runs Cronium scripts on remote hosts over pooled SSH connections.</p>
    <h2>Endpoints</h2>
    <ul>
        <li><code>/mcp</code> - MCP streamable HTTP (POST requests, GET event stream)</li>
        <li><code>/terminal</code> - interactive shell over WebSocket</li>
        <li><code>/health</code> - pool health as JSON</li>
    </ul>
    <h2>Tools</h2>
    <ul>
        <li><code>run_script</code> - bash, python, node or http script on a host</li>
        <li><code>prewarm_connection</code> - open a pooled connection ahead of a run</li>
        <li><code>pool_status</code> - pooled connections and counters</li>
    </ul>
</body>
</html>"#,
    )
}

async fn terminal_handler(
    State(server): State<CroniumServer>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| terminal_session(socket, server))
}

/// Map a text frame received after the open request to shell input.
fn text_input(text: String) -> ShellInput {
    match serde_json::from_str::<TerminalControl>(&text) {
        Ok(TerminalControl::Resize { cols, rows }) => ShellInput::Resize(PtySize { cols, rows }),
        Err(_) => ShellInput::Data(text.into_bytes()),
    }
}

async fn reject(mut socket: WebSocket, message: String) {
    tracing::warn!(%message, "Terminal request rejected");
    let _ = socket
        .send(Message::Text(
            serde_json::json!({ "type": "error", "message": message }).to_string(),
        ))
        .await;
    let _ = socket.close().await;
}

async fn terminal_session(mut socket: WebSocket, server: CroniumServer) {
    let open = match socket.recv().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<TerminalOpenRequest>(&text),
        _ => {
            tracing::debug!("Terminal socket closed before open request");
            return;
        }
    };
    let open = match open {
        Ok(open) => open,
        Err(e) => return reject(socket, format!("invalid open request: {e}")).await,
    };

    let cols = open.cols.unwrap_or(server.config().default_cols);
    let rows = open.rows.unwrap_or(server.config().default_rows);
    let target = open.target.into_target();
    let key = target.key();

    let shell = match server.terminals().open_shell(&target, cols, rows).await {
        Ok(shell) => shell,
        Err(e) => return reject(socket, e.to_string()).await,
    };
    tracing::info!(key = %key, cols, rows, "Terminal attached");

    let (writer, mut events) = shell.into_parts();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                let input = match frame {
                    Some(Ok(Message::Text(text))) => text_input(text),
                    Some(Ok(Message::Binary(bytes))) => ShellInput::Data(bytes),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        let _ = writer.close().await;
                        break;
                    }
                };
                let sent = match input {
                    ShellInput::Data(bytes) => writer.write(bytes).await,
                    ShellInput::Resize(size) => writer.resize(size.cols, size.rows).await,
                    ShellInput::Close => writer.close().await,
                };
                if sent.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(ShellEvent::Output(bytes)) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        let _ = writer.close().await;
                        break;
                    }
                }
                Some(ShellEvent::Exit(code)) => {
                    let frame = serde_json::json!({ "type": "exit", "code": code }).to_string();
                    let _ = sink.send(Message::Text(frame)).await;
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    tracing::info!(key = %key, "Terminal detached");
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: CroniumServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
