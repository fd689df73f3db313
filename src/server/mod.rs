//! HTTP API and WebSocket event stream over the orchestrator.
//!
//! | File     | Contents |
//! |----------|----------|
//! | `api.rs` | `AppState`, `ApiError`, REST routes |
//! | `ws.rs`  | `/ws` event stream with ping/pong keepalive |

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::DockyardConfig;
use crate::orchestrator::Orchestrator;
use api::{AppState, SharedState};

/// Build the full application router with the REST API and `/ws`.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// CORS for the configured origins. `*` allows any origin; an empty list
/// installs no layer.
pub fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    if origins.iter().any(|o| o == "*") {
        return Some(CorsLayer::permissive());
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Serve the API until Ctrl+C.
pub async fn start_server(config: &DockyardConfig, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let mut app = build_router(AppState::new(orchestrator)).layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(&config.server.cors_origins) {
        app = app.layer(cors);
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "dockyard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let h = harness();
        let app = build_router(AppState::new(h.orchestrator.clone()));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let h = harness();
        let app = build_router(AppState::new(h.orchestrator.clone()));
        let req = Request::builder()
            .uri("/ws?container=c1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_cors_layer() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["*".to_string()]).is_some());
        assert!(cors_layer(&["http://localhost:5173".to_string()]).is_some());
    }
}
