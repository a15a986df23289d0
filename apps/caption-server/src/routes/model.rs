use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness. Reports the active identifier, or the configured primary
/// before anything has loaded.
pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let model = state
        .loader
        .snapshot()
        .active_identifier
        .unwrap_or_else(|| state.loader.primary_identifier().to_string());
    Json(json!({ "ok": true, "model": model }))
}

pub(super) async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.loader.snapshot();
    let mut body = json!({
        "ready": snapshot.is_ready(),
        "model": snapshot.active_identifier,
        "status": snapshot.status,
    });
    if let Some(error) = snapshot.last_error {
        body["error"] = json!(error);
    }
    Json(body)
}

/// Blocks until the model is loaded or both identifiers have failed.
pub(super) async fn warmup(State(state): State<AppState>) -> impl IntoResponse {
    match state.loader.acquire().await {
        Ok(model) => (
            StatusCode::OK,
            Json(json!({ "ready": true, "model": model.identifier })),
        ),
        Err(e) => {
            tracing::error!("warmup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ready": false, "error": e.to_string() })),
            )
        }
    }
}
