//! Integration tests for the scan resolution pipeline.
//!
//! These require a running PostgreSQL instance configured via DATABASE_URL
//! (the rest of the config is filled with placeholders; external services
//! are replaced by in-process fakes).
//!
//! Batch claims are global, so run these serially:
//! cargo test --test integration_test -- --ignored --test-threads=1

use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use cellar_scan::app_state::AppState;
use cellar_scan::db::{self, catalog_queries, job_queries};
use cellar_scan::models::job::JobStatus;
use cellar_scan::models::matching::LabelMatch;
use cellar_scan::models::wine::ExtractedWineData;
use cellar_scan::services::enrichment::EnrichmentEngine;
use cellar_scan::services::extraction::ExtractionEngine;
use cellar_scan::services::inference::{ChatJsonRequest, InferenceClient, InferenceError};
use cellar_scan::services::pipeline;
use cellar_scan::services::vector_search::{IndexImageRequest, LabelMatcher, SearchError};

const IMAGE_HOST: &str = "images.example.com";

/// Matcher fake: optionally returns one canned visual hit, always misses on text.
struct FakeMatcher {
    visual_hit: Option<LabelMatch>,
}

impl FakeMatcher {
    fn miss() -> Self {
        Self { visual_hit: None }
    }

    fn hit(wine_id: Uuid, vintage_id: Uuid) -> Self {
        Self {
            visual_hit: Some(LabelMatch {
                wine_id,
                vintage_id: Some(vintage_id),
                producer_name: Some("Known Producer".into()),
                wine_name: Some("Known Wine".into()),
                similarity: 0.97,
            }),
        }
    }
}

#[async_trait]
impl LabelMatcher for FakeMatcher {
    async fn match_image(&self, _image_url: &str) -> Result<Option<LabelMatch>, SearchError> {
        Ok(self.visual_hit.clone())
    }

    async fn match_text(&self, _text: &str) -> Result<Option<LabelMatch>, SearchError> {
        Ok(None)
    }

    async fn index_image(&self, _request: &IndexImageRequest) -> Result<(), SearchError> {
        Ok(())
    }
}

/// Inference fake: returns a canned extraction and counts invocations.
struct FakeInference {
    response: serde_json::Value,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl InferenceClient for FakeInference {
    async fn complete_json(
        &self,
        _request: &ChatJsonRequest,
    ) -> Result<serde_json::Value, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

async fn test_pool() -> PgPool {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::init_pool(&url).await.expect("Failed to connect");
    db::run_migrations(&pool).await.expect("Failed to migrate");
    pool
}

fn state_with(
    pool: PgPool,
    matcher: Arc<dyn LabelMatcher>,
    inference_calls: Arc<AtomicUsize>,
    response: serde_json::Value,
) -> AppState {
    let inference = Arc::new(FakeInference {
        response,
        calls: inference_calls,
    });
    let extraction = ExtractionEngine::new(
        inference.clone(),
        "fast-model",
        "strong-model",
        vec![IMAGE_HOST.to_string()],
    );
    let enrichment = EnrichmentEngine::new(inference, "model");
    AppState::new(pool, matcher, extraction, enrichment)
}

fn unique(prefix: &str) -> String {
    format!("{} {}", prefix, Uuid::new_v4())
}

fn image_url() -> String {
    format!("https://{}/labels/{}.jpg", IMAGE_HOST, Uuid::new_v4())
}

fn extraction_response(producer: &str, wine: &str) -> serde_json::Value {
    json!({
        "producer": producer,
        "wine_name": wine,
        "year": 2019,
        "country": "France",
        "region": "Burgundy",
        "varietals": ["Pinot Noir"],
        "abv_percent": 13.0,
        "confidence": 0.92,
        "producer_website": "https://example.org",
        "producer_address": "1 Rue du Vin",
        "latitude": 47.0,
        "longitude": 4.8,
    })
}

#[tokio::test]
#[ignore]
async fn producer_upsert_is_race_tolerant_and_case_insensitive() {
    let pool = test_pool().await;
    let name = unique("Domaine X");

    let upper = ExtractedWineData {
        producer: name.to_uppercase(),
        wine_name: "Cuvee".into(),
        ..Default::default()
    };
    let lower = ExtractedWineData {
        producer: name.to_lowercase(),
        wine_name: "Cuvee".into(),
        ..Default::default()
    };

    let (a, b) = tokio::join!(
        catalog_queries::find_or_create_producer(&pool, &upper, None),
        catalog_queries::find_or_create_producer(&pool, &lower, None),
    );

    assert_eq!(a.unwrap(), b.unwrap(), "both casings must resolve to one row");
}

#[tokio::test]
#[ignore]
async fn vintage_null_year_is_its_own_slot() {
    let pool = test_pool().await;

    let data = ExtractedWineData {
        producer: unique("NV Producer"),
        wine_name: "House Blend NV".into(),
        ..Default::default()
    };
    let producer_id = catalog_queries::find_or_create_producer(&pool, &data, None)
        .await
        .unwrap();
    let (wine_id, created) =
        catalog_queries::find_or_create_wine(&pool, producer_id, &data.wine_name, true)
            .await
            .unwrap();
    assert!(created);

    let nv_a = catalog_queries::get_or_create_vintage(&pool, wine_id, None, None)
        .await
        .unwrap();
    let nv_b = catalog_queries::get_or_create_vintage(&pool, wine_id, None, Some(12.5))
        .await
        .unwrap();
    let dated = catalog_queries::get_or_create_vintage(&pool, wine_id, Some(2018), None)
        .await
        .unwrap();

    assert_eq!(nv_a, nv_b, "null year resolves to a single NV slot");
    assert_ne!(nv_a, dated);
}

#[tokio::test]
#[ignore]
async fn varietal_assignment_replaces_prior_set_with_even_split() {
    let pool = test_pool().await;

    let data = ExtractedWineData {
        producer: unique("Varietal Producer"),
        wine_name: "Field Blend".into(),
        ..Default::default()
    };
    let producer_id = catalog_queries::find_or_create_producer(&pool, &data, None)
        .await
        .unwrap();
    let (wine_id, _) =
        catalog_queries::find_or_create_wine(&pool, producer_id, &data.wine_name, false)
            .await
            .unwrap();
    let vintage_id = catalog_queries::get_or_create_vintage(&pool, wine_id, Some(2020), None)
        .await
        .unwrap();

    let first = vec![unique("Syrah"), unique("Grenache")];
    catalog_queries::replace_vintage_varietals(&pool, vintage_id, &first)
        .await
        .unwrap();

    let second = vec![unique("Merlot"), unique("Cabernet"), unique("Franc")];
    catalog_queries::replace_vintage_varietals(&pool, vintage_id, &second)
        .await
        .unwrap();

    let rows = sqlx::query("SELECT percent FROM vintage_varietals WHERE vintage_id = $1")
        .bind(vintage_id)
        .fetch_all(&pool)
        .await
        .unwrap();

    assert_eq!(rows.len(), 3, "only the second set survives");
    for row in rows {
        let percent: f64 = row.try_get("percent").unwrap();
        assert_eq!(percent, 33.33);
    }
}

#[tokio::test]
#[ignore]
async fn retry_ceiling_routes_to_failed_after_fourth_failure() {
    let pool = test_pool().await;

    let job = job_queries::create_job(&pool, Uuid::new_v4(), &image_url(), None, None)
        .await
        .unwrap();

    for attempt in 1..=3 {
        let (status, retries) = job_queries::record_failure(&pool, job.id, "boom")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Pending, "attempt {attempt} stays reclaimable");
        assert_eq!(retries, attempt);
    }

    let (status, retries) = job_queries::record_failure(&pool, job.id, "boom")
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(retries, 4);

    // A failed job is never reclaimed.
    let claimed = job_queries::claim_pending_jobs(&pool, 20).await.unwrap();
    assert!(claimed.iter().all(|j| j.id != job.id));
}

#[tokio::test]
#[ignore]
async fn failed_completion_write_routes_job_back_to_pending() {
    let pool = test_pool().await;

    // Fault injection: reject the completed-status write for jobs carrying
    // the marker OCR text, leaving every other row untouched.
    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION reject_marked_completions() RETURNS trigger AS $fn$
        BEGIN
            IF NEW.status = 'completed' AND NEW.ocr_text = 'reject completion' THEN
                RAISE EXCEPTION 'completion rejected';
            END IF;
            RETURN NEW;
        END;
        $fn$ LANGUAGE plpgsql
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("DROP TRIGGER IF EXISTS reject_marked_completions ON scan_jobs")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_marked_completions BEFORE UPDATE ON scan_jobs \
         FOR EACH ROW EXECUTE FUNCTION reject_marked_completions()",
    )
    .execute(&pool)
    .await
    .unwrap();

    let job = job_queries::create_job(
        &pool,
        Uuid::new_v4(),
        &image_url(),
        Some("reject completion"),
        None,
    )
    .await
    .unwrap();

    let state = state_with(
        pool.clone(),
        Arc::new(FakeMatcher::miss()),
        Arc::new(AtomicUsize::new(0)),
        extraction_response(&unique("Unpersistable Producer"), "Cuvee"),
    );

    let summary = pipeline::process_batch(&state, Some(20)).await.unwrap();
    assert!(summary.failed >= 1);

    // The job must not be stranded in `working`: it goes back to `pending`
    // with the error recorded, so a later claim can pick it up again.
    let routed = job_queries::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(routed.status, JobStatus::Pending);
    assert_eq!(routed.retry_count, 1);
    assert!(routed
        .error_message
        .unwrap()
        .contains("failed to persist completion"));

    sqlx::query("DROP TRIGGER reject_marked_completions ON scan_jobs")
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn concurrent_claims_never_lease_the_same_job() {
    let pool = test_pool().await;

    let mut created = Vec::new();
    for _ in 0..6 {
        created.push(
            job_queries::create_job(&pool, Uuid::new_v4(), &image_url(), None, None)
                .await
                .unwrap()
                .id,
        );
    }

    let (a, b) = tokio::join!(
        job_queries::claim_pending_jobs(&pool, 3),
        job_queries::claim_pending_jobs(&pool, 3),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    for job in a.iter().chain(b.iter()) {
        assert_eq!(job.status, JobStatus::Working);
    }
    for job_a in &a {
        assert!(b.iter().all(|job_b| job_b.id != job_a.id), "job leased twice");
    }
}

#[tokio::test]
#[ignore]
async fn visual_match_short_circuits_extraction() {
    let pool = test_pool().await;

    // Seed a catalog entry for the hit to point at.
    let data = ExtractedWineData {
        producer: unique("Matched Producer"),
        wine_name: "Matched Wine".into(),
        ..Default::default()
    };
    let producer_id = catalog_queries::find_or_create_producer(&pool, &data, None)
        .await
        .unwrap();
    let (wine_id, _) =
        catalog_queries::find_or_create_wine(&pool, producer_id, &data.wine_name, false)
            .await
            .unwrap();
    let vintage_id = catalog_queries::get_or_create_vintage(&pool, wine_id, None, None)
        .await
        .unwrap();

    let job = job_queries::create_job(&pool, Uuid::new_v4(), &image_url(), Some("ocr"), None)
        .await
        .unwrap();

    let inference_calls = Arc::new(AtomicUsize::new(0));
    let state = state_with(
        pool.clone(),
        Arc::new(FakeMatcher::hit(wine_id, vintage_id)),
        inference_calls.clone(),
        json!({}),
    );

    let summary = pipeline::process_batch(&state, Some(20)).await.unwrap();
    assert!(summary.visual_matches >= 1);
    assert_eq!(
        inference_calls.load(Ordering::SeqCst),
        0,
        "extraction must never run on a visual match"
    );

    let resolved = job_queries::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, JobStatus::Completed);
    let processed = resolved.processed_data.unwrap();
    assert_eq!(processed["wine_id"], json!(wine_id.to_string()));
    assert_eq!(processed["match_method"], json!("visual_embedding"));
}

#[tokio::test]
#[ignore]
async fn duplicate_submission_copies_processed_data() {
    let pool = test_pool().await;

    let producer = unique("Idempotent Producer");
    let url = image_url();
    let user = Uuid::new_v4();

    let first = job_queries::create_job(&pool, user, &url, Some("same ocr"), None)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let state = state_with(
        pool.clone(),
        Arc::new(FakeMatcher::miss()),
        calls.clone(),
        extraction_response(&producer, "Grand Cru"),
    );

    pipeline::process_batch(&state, Some(20)).await.unwrap();
    let first_done = job_queries::get_job(&pool, first.id).await.unwrap().unwrap();
    assert_eq!(first_done.status, JobStatus::Completed);
    let calls_after_first = calls.load(Ordering::SeqCst);
    assert!(calls_after_first >= 1);

    // Same (image_url, ocr_text) again: must not re-extract or re-create.
    let second = job_queries::create_job(&pool, user, &url, Some("same ocr"), None)
        .await
        .unwrap();
    pipeline::process_batch(&state, Some(20)).await.unwrap();

    let second_done = job_queries::get_job(&pool, second.id).await.unwrap().unwrap();
    assert_eq!(second_done.status, JobStatus::Completed);
    assert_eq!(second_done.processed_data, first_done.processed_data);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        calls_after_first,
        "duplicate must skip extraction entirely"
    );

    // Exactly one producer row exists for the extracted name.
    let count: i64 =
        sqlx::query("SELECT COUNT(*) AS n FROM producers WHERE LOWER(name) = LOWER($1)")
            .bind(&producer)
            .fetch_one(&pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
    assert_eq!(count, 1);

    // A resubmission is still a submission: each job records its own tasting
    // against the already-resolved vintage.
    let processed = first_done.processed_data.unwrap();
    let vintage_id: Uuid = processed["vintage_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let tastings: i64 = sqlx::query("SELECT COUNT(*) AS n FROM tastings WHERE vintage_id = $1")
        .bind(vintage_id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get("n")
        .unwrap();
    assert_eq!(tastings, 2);
}

#[tokio::test]
#[ignore]
async fn queue_depth_gauge_is_exported_once_a_recorder_is_installed() {
    let pool = test_pool().await;

    // Same wiring as the worker binary: the gauge only reaches Prometheus
    // output when a recorder has been installed first.
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .unwrap();
    metrics::describe_gauge!("scan_queue_depth", "Scan jobs waiting to be claimed");

    job_queries::create_job(&pool, Uuid::new_v4(), &image_url(), None, None)
        .await
        .unwrap();
    let depth = job_queries::pending_count(&pool).await.unwrap();
    assert!(depth >= 1);
    metrics::gauge!("scan_queue_depth").set(depth as f64);

    let rendered = handle.render();
    assert!(rendered.contains("scan_queue_depth"));
}

#[tokio::test]
#[ignore]
async fn extraction_path_builds_full_catalog_chain() {
    let pool = test_pool().await;

    let producer = unique("Chain Producer");
    let job = job_queries::create_job(&pool, Uuid::new_v4(), &image_url(), None, None)
        .await
        .unwrap();

    let state = state_with(
        pool.clone(),
        Arc::new(FakeMatcher::miss()),
        Arc::new(AtomicUsize::new(0)),
        extraction_response(&producer, "Les Amoureuses"),
    );

    let summary = pipeline::process_batch(&state, Some(20)).await.unwrap();
    assert!(summary.openai_matches >= 1);

    let done = job_queries::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let processed = done.processed_data.unwrap();
    assert_eq!(processed["producer_name"], json!(producer));
    assert_eq!(processed["year"], json!(2019));
    assert_eq!(processed["match_method"], json!("openai_vision"));

    // Tasting created for the submitting user with a null verdict.
    let vintage_id = Uuid::parse_str(processed["vintage_id"].as_str().unwrap()).unwrap();
    let tasting = sqlx::query("SELECT verdict, notes FROM tastings WHERE vintage_id = $1")
        .bind(vintage_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let verdict: Option<String> = tasting.try_get("verdict").unwrap();
    let notes: String = tasting.try_get("notes").unwrap();
    assert!(verdict.is_none());
    assert!(notes.contains("Pinot Noir"));
}
