//! Allocator route handlers.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::ApiState;

const YAML_CONTENT_TYPE: &str = "application/yaml";

/// GET /scrape_configs
pub async fn scrape_configs(State(state): State<ApiState>) -> Response {
    match state.store.body() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, YAML_CONTENT_TYPE)],
            body.to_string(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "scrape configuration not loaded yet",
        )
            .into_response(),
    }
}

/// GET /livez
pub async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /readyz
pub async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    if state.store.is_loaded() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
