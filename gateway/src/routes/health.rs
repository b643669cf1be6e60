use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `"ok"` or `"unavailable"`.
    pub backend: String,
    pub model: String,
    pub in_flight: usize,
    pub capacity: usize,
}

/// GET /health - liveness plus a backend reachability check
///
/// Always 200. A dead backend degrades the status rather than failing the request.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backend = state.router.backend();
    let backend_status = match backend.health_check().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!("Backend health check failed: {}", e);
            "unavailable"
        }
    };
    let admission = state.router.admission();

    Json(HealthResponse {
        status: if backend_status == "ok" { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: backend_status.to_string(),
        model: backend.model_name().to_string(),
        in_flight: admission.in_flight(),
        capacity: admission.capacity(),
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
