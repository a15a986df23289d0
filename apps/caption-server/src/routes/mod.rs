mod caption;
mod model;

use crate::AppState;
use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

pub const BANNER: &str = "caption-server: POST /caption with {\"image_url\"} or {\"image_base64\"}";

pub fn get_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { BANNER }))
        .route("/health", get(model::health))
        .route("/ready", get(model::ready))
        .route("/warmup", get(model::warmup))
        .route("/caption", post(caption::caption))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        )
        .layer(middleware::from_fn(preflight_no_content))
}

/// Preflight answers are `204` with an empty body.
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;

    if is_preflight
        && (response.status().is_success() || response.status() == StatusCode::METHOD_NOT_ALLOWED)
    {
        *response.status_mut() = StatusCode::NO_CONTENT;
        *response.body_mut() = Body::empty();
        response.headers_mut().remove(axum::http::header::CONTENT_LENGTH);
        response.headers_mut().remove(axum::http::header::CONTENT_TYPE);
    }
    response
}
