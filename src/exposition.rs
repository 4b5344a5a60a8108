//! Text exposition of the registry and the HTTP scrape endpoint.
//!
//! [`render`] encodes a [`RegistrySnapshot`] with the `prometheus`
//! `TextEncoder` (text format version 0.0.4). The endpoint serves it at
//! `GET /metrics`; encoding happens after the snapshot is taken, so a slow
//! scraper never holds up registry writers.

use crate::registry::{MetricRegistry, RegistryError, RegistrySnapshot};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const INDEX_PAGE: &str = "<html>\n<head><title>opmetrics aggregator</title></head>\n<body>\n<h1>opmetrics aggregator</h1>\n<p><a href=\"/metrics\">Metrics</a></p>\n</body>\n</html>\n";

/// Encode every family of the snapshot in the text exposition format.
pub fn render(snapshot: &RegistrySnapshot) -> Result<String, RegistryError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::with_capacity(4096);
    encoder.encode(&snapshot.families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| RegistryError::Prometheus(prometheus::Error::Msg(e.to_string())))
}

async fn metrics_handler(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match render(&registry.snapshot()) {
        Ok(body) => {
            debug!(bytes = body.len(), "Served scrape");
            let content_type = TextEncoder::new().format_type().to_string();
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Routes of the scrape endpoint. Unknown paths fall through to 404.
pub fn router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// Bind the scrape port
///
/// Binding happens synchronously so that an address conflict surfaces before
/// the aggregator reports itself ready.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Serve scrapes until `shutdown` turns true.
pub async fn serve(
    listener: std::net::TcpListener,
    registry: Arc<MetricRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    info!(addr = %listener.local_addr()?, "Scrape endpoint listening");

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
