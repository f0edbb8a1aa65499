//! HTTP monitoring routes for the embedded broker.
//!
//! - `GET /healthz` - Liveness probe
//! - `GET /varz` - Connection, subscription and message counters
//! - `GET /connz` - Per-connection details

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::router::{BrokerStats, ConnectionInfo, Router as SubjectRouter};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub fn routes(router: Arc<SubjectRouter>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/varz", get(varz))
        .route("/connz", get(connz))
        .layer(TraceLayer::new_for_http())
        .with_state(router)
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn varz(State(router): State<Arc<SubjectRouter>>) -> Json<BrokerStats> {
    Json(router.stats())
}

async fn connz(State(router): State<Arc<SubjectRouter>>) -> Json<Vec<ConnectionInfo>> {
    Json(router.connections())
}
