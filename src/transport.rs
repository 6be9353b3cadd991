//! Wire transports the gateway can be served over, beyond the stdio path
//! `main.rs` uses for a single direct Claude Code session.
//!
//! Grounded on `backend/http.rs`'s client-side use of rmcp's
//! `streamable_http_client` transport to talk to remote MCP backends — this
//! module is the server-side mirror, using rmcp's `streamable_http_server`
//! and `sse_server` so the same [`crate::server::BrokerServer`] can be
//! reached over a long-lived HTTP connection instead of a child process's
//! stdio pipes. Session state (`Mcp-Session-Id`, SSE resumption via
//! `Last-Event-ID`) is handled entirely inside rmcp's `LocalSessionManager`;
//! this module only wires config (host/port/path/stateless) into it.

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::TransportConfig;
use crate::server::BrokerServer;

/// Serve `server` over rmcp's streamable-HTTP transport at `config.path`,
/// until `shutdown` fires.
///
/// A single axum route (`POST`/`GET`/`DELETE` on `config.path`) is nested
/// under rmcp's `StreamableHttpService`, which itself demultiplexes methods,
/// issues/validates `Mcp-Session-Id`, and resumes a dropped SSE stream from
/// `Last-Event-ID` when `config.stateless` is false.
pub async fn serve_streamable_http(
    server: BrokerServer,
    config: &TransportConfig,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind streamable-HTTP transport on {addr}"))?;

    let service_config = StreamableHttpServerConfig {
        stateful_mode: !config.stateless,
        ..Default::default()
    };

    let http_service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        service_config,
    );

    let router = axum::Router::new().nest_service(config.path.as_str(), http_service);

    info!(
        addr = %addr,
        path = %config.path,
        stateless = config.stateless,
        "serving MCP over streamable-HTTP"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .context("streamable-HTTP server exited with error")
}

/// Serve `server` over the legacy SSE transport (`GET /sse` + `POST
/// /message`) for clients that haven't moved to streamable-HTTP yet.
pub async fn serve_sse(
    server: BrokerServer,
    config: &TransportConfig,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid SSE bind address {}:{}", config.host, config.port))?;

    let ct = SseServer::serve(addr)
        .await
        .context("failed to bind SSE transport")?
        .with_service(move || server.clone());

    info!(addr = %addr, "serving MCP over SSE");

    shutdown.notified().await;
    ct.cancel();
    Ok(())
}
