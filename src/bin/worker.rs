use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use cellar_scan::app_state::AppState;
use cellar_scan::config::AppConfig;
use cellar_scan::db::{self, job_queries};
use cellar_scan::services::{
    enrichment::EnrichmentEngine,
    extraction::ExtractionEngine,
    inference::OpenAiClient,
    pipeline,
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

    tracing::info!("Starting scan resolution worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Install Prometheus exporter with its own scrape endpoint
    let metrics_addr: SocketAddr = config
        .metrics_bind_addr
        .parse()
        .expect("Invalid metrics bind address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");

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

    tracing::info!("Serving Prometheus metrics on {}", metrics_addr);

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!("Initializing services");
    let matcher = LabelSearchClient::new(
        &config.search_base_url,
        config.search_api_key.clone(),
        config.visual_match_threshold,
        config.text_match_threshold,
    )
    .expect("Failed to initialize label search client");

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

    let state = AppState::new(db_pool, Arc::new(matcher), extraction, enrichment);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    tracing::info!("Worker ready, starting batch processing loop");

    loop {
        if let Ok(depth) = job_queries::pending_count(&state.db).await {
            metrics::gauge!("scan_queue_depth").set(depth as f64);
        }

        match pipeline::process_batch(&state, None).await {
            Ok(summary) if summary.total > 0 => {
                tracing::info!(
                    processed = summary.processed,
                    failed = summary.failed,
                    total = summary.total,
                    "Batch complete, checking for more jobs"
                );
            }
            Ok(_) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim jobs, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}
