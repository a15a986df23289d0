use crate::image_source::ImageSourceError;
use ai::LoadError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failure of an HTTP operation, rendered as `{"error": "<message>"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    Acquisition(String),
    #[error(transparent)]
    ModelLoad(#[from] LoadError),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Input(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ImageSourceError> for ApiError {
    fn from(e: ImageSourceError) -> Self {
        if e.is_input_error() {
            Self::Input(e.to_string())
        } else {
            Self::Acquisition(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("rejected request: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
