// Sidecar module - ingest server and dashboard host
//
// Small axum server with three routes: POST /ingest receives streamed events,
// GET /stats renders the dashboard, GET /stats/favicon.ico answers 204. All
// writes funnel through the single-writer store.

pub mod dashboard;
pub mod ingest;
pub mod store;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

/// Time limit for one request, response included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SidecarState {
    pub store: Arc<Store>,
}

/// Run the sidecar until ctrl-c.
pub async fn run(db_path: &Path, listen: &str) -> Result<()> {
    let store = Arc::new(Store::open(db_path)?);
    let state = SidecarState { store };

    let app = Router::new()
        .route("/ingest", post(ingest::ingest_handler))
        .route("/stats", get(dashboard::stats_handler))
        .route("/stats/favicon.ico", get(dashboard::favicon_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state);

    let addr = normalize_listen_addr(listen)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    tracing::info!("sidecar listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("sidecar server")?;

    tracing::info!("sidecar shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Accept both full socket addresses and the shorthand ":7070" form.
fn normalize_listen_addr(listen: &str) -> Result<SocketAddr> {
    let candidate = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    candidate
        .parse()
        .with_context(|| format!("invalid listen address {:?}", listen))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(
            normalize_listen_addr(":7070").unwrap(),
            "0.0.0.0:7070".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            normalize_listen_addr("127.0.0.1:8081").unwrap(),
            "127.0.0.1:8081".parse::<SocketAddr>().unwrap()
        );
        assert!(normalize_listen_addr("nonsense").is_err());
    }
}
