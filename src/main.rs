use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cellar_scan::app_state::AppState;
use cellar_scan::config::AppConfig;
use cellar_scan::db;
use cellar_scan::routes;
use cellar_scan::services::{
    enrichment::EnrichmentEngine,
    extraction::ExtractionEngine,
    inference::OpenAiClient,
    vector_search::LabelSearchClient,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing cellar-scan server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "scan_job_seconds",
        "Time to resolve a single scan job"
    );
    metrics::describe_counter!(
        "scan_jobs_processed_total",
        "Total scan jobs resolved successfully"
    );
    metrics::describe_counter!(
        "scan_jobs_failed_total",
        "Total scan job attempts that failed"
    );
    metrics::describe_counter!(
        "scan_match_total",
        "Resolved scans by match method"
    );
    metrics::describe_gauge!(
        "scan_queue_depth",
        "Current number of pending scan jobs"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize label search client (visual + text indices)
    tracing::info!("Initializing label search client");
    let matcher = LabelSearchClient::new(
        &config.search_base_url,
        config.search_api_key.clone(),
        config.visual_match_threshold,
        config.text_match_threshold,
    )
    .expect("Failed to initialize label search client");

    // Initialize inference client and engines
    tracing::info!("Initializing inference client");
    let inference = Arc::new(
        OpenAiClient::new(&config.inference_base_url, &config.inference_api_key)
            .expect("Failed to initialize inference client"),
    );
    let extraction = ExtractionEngine::new(
        inference.clone(),
        &config.extraction_model,
        &config.extraction_strong_model,
        config.allowed_image_hosts.clone(),
    );
    let enrichment = EnrichmentEngine::new(inference, &config.enrichment_model);

    // Create shared application state
    let state = AppState::new(db_pool, Arc::new(matcher), extraction, enrichment);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/scans/process", post(routes::process::process_scans))
        .route(
            "/api/v1/scans/jobs/{job_id}",
            get(routes::process::get_job_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    tracing::info!("Starting cellar-scan on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
