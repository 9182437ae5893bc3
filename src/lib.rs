use axum::{routing::get, Router};
use utoipa::OpenApi;
use utoipa_redoc::{Redoc, Servable};
use utoipa_swagger_ui::SwaggerUi;

pub mod logging;
pub mod routes;

#[derive(OpenApi)]
#[openapi(
    paths(routes::health::health_check),
    tags(
        (name = "System", description = "System health and status endpoints")
    )
)]
pub struct ApiDoc;

/// Builds the application router: the health route plus the API docs mounts.
pub fn app() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(Redoc::with_url("/redoc", ApiDoc::openapi()))
        .route("/", get(routes::health::health_check))
}
