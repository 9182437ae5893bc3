use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/",
    tag = "System",
    responses(
        (status = 200, description = "Service is running")
    )
)]
pub async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, Json(json!({ "message": "Hello World" })))
}
