//! Read-only meta API, mounted under `/_fluxion/`. The underscore prefix
//! keeps the whole tree unreachable from dynamic routing.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::server::AppState;

pub async fn routes(State(state): State<AppState>) -> Response {
    match state.runtime.route_snapshot().await {
        Ok(snapshot) => Json(json!({ "routes": snapshot })).into_response(),
        Err(err) => {
            error!("route snapshot failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "Internal Server Error" })),
            )
                .into_response()
        }
    }
}

pub async fn healthz() -> Json<serde_json::Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Json(json!({ "ok": true, "now": now }))
}

pub async fn workers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "workers": state.runtime.worker_snapshot() }))
}
