use std::env;
use std::path::PathBuf;

use vitals::logging;

#[tokio::main]
async fn main() {
    // Optional .env file for local development
    dotenvy::dotenv().ok();

    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let json_format = env::var("JSON_LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let log_file = env::var("LOG_FILE").ok().map(PathBuf::from);

    // Held for the process lifetime so the file writer keeps flushing
    let _logging_guard = logging::setup_logging(&log_level, json_format, log_file.as_deref())
        .expect("Failed to initialize logging");

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");

    tracing::info!("🚀 Server started successfully");
    tracing::info!(
        "    Swagger UI: http://{}/swagger-ui",
        listener.local_addr().unwrap()
    );
    tracing::info!(
        "    Redoc:      http://{}/redoc",
        listener.local_addr().unwrap()
    );

    axum::serve(listener, vitals::app()).await.unwrap();
}
