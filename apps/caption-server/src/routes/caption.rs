use crate::{caption::CaptionRequest, error::ApiError, AppState};
use axum::{body::Bytes, extract::State, Json};

/// The body is parsed here rather than through the `Json` extractor so that
/// malformed JSON gets the same `{error}` envelope as every other failure.
pub(super) async fn caption(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<crate::caption::CaptionResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CaptionRequest::default()
    } else {
        serde_json::from_slice::<CaptionRequest>(&body)
            .map_err(|e| ApiError::Input(format!("invalid JSON body: {}", e)))?
    };

    let response = state.captioner.caption(request).await?;
    tracing::info!(
        model_id = %response.model,
        latency_ms = response.latency_ms,
        "caption generated"
    );
    Ok(Json(response))
}
