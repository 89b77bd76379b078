use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::json;

use crate::database::connection::ConnectionStats;
use crate::pipeline::health::HealthSnapshot;
use crate::pipeline::registry::KnownProgram;
use crate::server::AppState;

/// Liveness probe.
///
/// # Route
/// - **Method**: GET
/// - **Path**: `/ping`
///
/// ```bash
/// curl http://localhost:3000/ping
/// # Response: {"status":"pong"}
/// ```
pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "pong" }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub wallet: String,
    pub storage_backend: &'static str,
    pub storage_ok: bool,
    pub connections: Option<ConnectionStats>,
    pub pools_tracked: usize,
    pub pipeline: HealthSnapshot,
    pub known_programs: Vec<KnownProgram>,
}

/// Pipeline status, counters, last error and last synthesis, plus the
/// program ids the decoder can name.
///
/// # Route
/// - **Method**: GET
/// - **Path**: `/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let storage_ok = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Storage health check failed: {}", e);
            false
        }
    };

    Json(HealthResponse {
        wallet: state.wallet.clone(),
        storage_backend: state.store.backend(),
        storage_ok,
        connections: state.store.connection_stats(),
        pools_tracked: state.pools.len(),
        pipeline: state.health.snapshot(),
        known_programs: state.registry.known_programs(),
    })
}
