use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, histogram};
use std::time::Instant;
use strum::Display;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::{catalog_queries, job_queries};
use crate::models::job::{ProcessedScan, ScanJob};
use crate::models::matching::{BatchSummary, LabelMatch, MatchMethod};
use crate::models::wine::ExtractedWineData;
use crate::services::extraction::ExtractionError;
use crate::services::idempotency;
use crate::services::vector_search::{IndexImageRequest, SearchError};

pub const DEFAULT_BATCH_LIMIT: i64 = 5;
pub const MAX_BATCH_LIMIT: i64 = 20;

/// Where in the per-job pipeline an error surfaced. Persisted in the job's
/// error message so operators can see which step keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Idempotency,
    VisualMatch,
    TextMatch,
    Extraction,
    SecondTextMatch,
    Enriching,
    Upserting,
    Tasting,
    Downstream,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A pipeline error tagged with the stage it occurred in.
#[derive(Debug, thiserror::Error)]
#[error("stage={stage}: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|e| StageError {
            stage,
            source: e.into(),
        })
    }
}

/// Claim up to `limit` pending jobs and run them all concurrently.
///
/// Jobs settle independently: one job's failure is absorbed at the job
/// boundary (routed through retry/fail) and never aborts its siblings. Only
/// a failure to claim at all is surfaced to the caller.
pub async fn process_batch(
    state: &AppState,
    limit: Option<i64>,
) -> Result<BatchSummary, sqlx::Error> {
    let limit = limit.unwrap_or(DEFAULT_BATCH_LIMIT).clamp(1, MAX_BATCH_LIMIT);

    let jobs = job_queries::claim_pending_jobs(&state.db, limit).await?;
    let total = jobs.len();
    info!(claimed = total, limit, "Claimed scan jobs");

    let outcomes = join_all(jobs.into_iter().map(|job| handle_job(state, job))).await;

    let mut summary = BatchSummary {
        total,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            Ok(method) => {
                summary.processed += 1;
                if let Some(method) = method {
                    summary.record_method(method);
                }
            }
            Err(()) => summary.failed += 1,
        }
    }

    counter!("scan_jobs_processed_total").increment(summary.processed as u64);
    counter!("scan_jobs_failed_total").increment(summary.failed as u64);

    Ok(summary)
}

/// Job boundary: run the pipeline, then land the job in `completed` or route
/// it through retry/fail. Nothing escapes past here.
async fn handle_job(state: &AppState, job: ScanJob) -> Result<Option<MatchMethod>, ()> {
    let started = Instant::now();
    let job_id = job.id;

    let result = process_job(state, &job).await;
    histogram!("scan_job_seconds").record(started.elapsed().as_secs_f64());

    match result {
        Ok(resolution) => {
            if let Err(e) =
                job_queries::complete_job(&state.db, job_id, &resolution.processed).await
            {
                error!(job_id = %job_id, error = %e, "Failed to mark job completed, routing to retry");
                // The upserts are idempotent, so re-running this job after a
                // failed completion write is safe.
                let message = format!("failed to persist completion: {e}");
                match job_queries::record_failure(&state.db, job_id, &message).await {
                    Ok((status, retries)) => {
                        warn!(job_id = %job_id, status = %status, retries, "Job routed after completion write failure");
                    }
                    Err(db_err) => {
                        // Store unreachable: the row stays leased in `working`
                        // until the store is back and the lease is re-queued.
                        error!(job_id = %job_id, error = %db_err, "Failed to route job after completion write failure");
                    }
                }
                return Err(());
            }
            if let Some(method) = resolution.method {
                counter!("scan_match_total", "method" => method.to_string()).increment(1);
            }
            info!(
                job_id = %job_id,
                method = ?resolution.method,
                duration_ms = started.elapsed().as_millis() as u64,
                "Scan job resolved"
            );
            Ok(resolution.method)
        }
        Err(e) => {
            let message = e.to_string();
            error!(job_id = %job_id, stage = %e.stage, error = %e.source, "Scan job failed");

            match job_queries::record_failure(&state.db, job_id, &message).await {
                Ok((status, retries)) => {
                    warn!(job_id = %job_id, status = %status, retries, "Job routed after failure");
                }
                Err(db_err) => {
                    // Store unreachable: the row stays leased in `working`
                    // until the store is back and the lease is re-queued.
                    error!(job_id = %job_id, error = %db_err, "Failed to record job failure");
                }
            }
            Err(())
        }
    }
}

struct JobResolution {
    processed: serde_json::Value,
    method: Option<MatchMethod>,
}

/// The per-job pipeline, strictly sequential: idempotency check, visual
/// match, text match, extraction, post-extraction text match, enrichment,
/// catalog upsert, tasting, downstream queuing.
async fn process_job(state: &AppState, job: &ScanJob) -> Result<JobResolution, StageError> {
    // ── Idempotency ──────────────────────────────────────────────────
    let key = match &job.idempotency_key {
        Some(key) => key.clone(),
        None => {
            let key = idempotency::compute_key(&job.image_url, job.ocr_text.as_deref());
            job_queries::set_idempotency_key(&state.db, job.id, &key)
                .await
                .at(Stage::Idempotency)?;
            key
        }
    };

    if let Some(duplicate) = job_queries::find_completed_duplicate(&state.db, &key, job.id)
        .await
        .at(Stage::Idempotency)?
    {
        info!(job_id = %job.id, "Duplicate submission, copying completed result");
        let copied = serde_json::from_value::<ProcessedScan>(duplicate.clone()).ok();
        // The wine is already resolved, but this job is still a submission of
        // its own: it gets its own tasting and scan metadata.
        if let Some(copied) = &copied {
            record_tasting(state, job, copied.vintage_id, "Added from a label scan.").await;
            record_scan_metadata(state, job, copied.match_method, copied.confidence).await;
        }
        return Ok(JobResolution {
            processed: duplicate,
            method: copied.map(|p| p.match_method),
        });
    }

    // ── Visual embedding match ───────────────────────────────────────
    if let Some(hit) = state
        .matcher
        .match_image(&job.image_url)
        .await
        .at(Stage::VisualMatch)?
    {
        // Year is not derivable from visual similarity; resolve to the NV slot
        // unless the index already carries the vintage.
        return finish_matched(state, job, hit, MatchMethod::VisualEmbedding, None).await;
    }

    // ── First-pass text match on raw OCR text ────────────────────────
    if let Some(ocr) = job.ocr_text.as_deref().filter(|t| !t.trim().is_empty()) {
        if let Some(hit) = state.matcher.match_text(ocr).await.at(Stage::TextMatch)? {
            return finish_matched(state, job, hit, MatchMethod::VectorIdentity, None).await;
        }
    }

    // ── Vision extraction ────────────────────────────────────────────
    let data = state
        .extraction
        .extract(&job.image_url, job.ocr_text.as_deref())
        .await
        .at(Stage::Extraction)?;

    // ── Second-pass text match on the extracted identity ─────────────
    let identity_query = compose_identity_query(&data);
    if let Some(hit) = state
        .matcher
        .match_text(&identity_query)
        .await
        .at(Stage::SecondTextMatch)?
    {
        return finish_matched(state, job, hit, MatchMethod::VectorIdentity, data.year).await;
    }

    // ── Knowledge enrichment (best-effort inside the engine) ─────────
    let data = state.enrichment.enrich(data).await;

    // ── Catalog upsert ───────────────────────────────────────────────
    let region_id = match (&data.region, &data.country) {
        (Some(region), Some(country)) => Some(
            catalog_queries::find_or_create_region(&state.db, region, country)
                .await
                .at(Stage::Upserting)?,
        ),
        _ => None,
    };

    let producer_id = catalog_queries::find_or_create_producer(&state.db, &data, region_id)
        .await
        .at(Stage::Upserting)?;

    let (wine_id, wine_created) = catalog_queries::find_or_create_wine(
        &state.db,
        producer_id,
        &data.wine_name,
        data.is_non_vintage(),
    )
    .await
    .at(Stage::Upserting)?;

    let vintage_id =
        catalog_queries::get_or_create_vintage(&state.db, wine_id, data.year, data.abv_percent)
            .await
            .at(Stage::Upserting)?;

    if !data.varietals.is_empty() {
        catalog_queries::replace_vintage_varietals(&state.db, vintage_id, &data.varietals)
            .await
            .at(Stage::Upserting)?;
    }

    job_queries::record_scan_match(&state.db, job.id, MatchMethod::OpenaiVision, data.confidence)
        .await
        .at(Stage::Upserting)?;

    // ── Tasting + scan metadata (best-effort) ────────────────────────
    let notes = compose_tasting_notes(
        data.region.as_deref(),
        data.country.as_deref(),
        &data.varietals,
    );
    record_tasting(state, job, vintage_id, &notes).await;
    record_scan_metadata(state, job, MatchMethod::OpenaiVision, data.confidence).await;

    // ── Downstream queuing (best-effort) ─────────────────────────────
    if wine_created {
        if let Err(e) = catalog_queries::enqueue_wine_enrichment(&state.db, wine_id).await {
            warn!(job_id = %job.id, error = %e, "Failed to enqueue wine enrichment");
        }
    }
    queue_embedding(state, job, wine_id, vintage_id).await;

    let processed = ProcessedScan {
        wine_id,
        vintage_id,
        producer_name: data.producer.clone(),
        wine_name: data.wine_name.clone(),
        year: data.year,
        match_method: MatchMethod::OpenaiVision,
        confidence: data.confidence,
    };

    Ok(JobResolution {
        processed: serde_json::to_value(&processed).at(Stage::Upserting)?,
        method: Some(MatchMethod::OpenaiVision),
    })
}

/// A search-index hit short-circuits extraction and upsert creation. Only the
/// vintage slot resolution, tasting, and scan metadata remain.
async fn finish_matched(
    state: &AppState,
    job: &ScanJob,
    hit: LabelMatch,
    method: MatchMethod,
    year: Option<i32>,
) -> Result<JobResolution, StageError> {
    info!(
        job_id = %job.id,
        wine_id = %hit.wine_id,
        method = %method,
        similarity = hit.similarity,
        "Matched label against existing catalog entry"
    );

    let vintage_id = match hit.vintage_id {
        Some(id) => id,
        None => catalog_queries::get_or_create_vintage(&state.db, hit.wine_id, year, None)
            .await
            .at(Stage::Upserting)?,
    };

    job_queries::record_scan_match(&state.db, job.id, method, hit.similarity)
        .await
        .at(Stage::Upserting)?;

    record_tasting(state, job, vintage_id, "Added from a label scan.").await;
    record_scan_metadata(state, job, method, hit.similarity).await;

    let processed = ProcessedScan {
        wine_id: hit.wine_id,
        vintage_id,
        producer_name: hit
            .producer_name
            .unwrap_or_else(|| crate::services::extraction::UNKNOWN_PRODUCER.to_string()),
        wine_name: hit
            .wine_name
            .unwrap_or_else(|| crate::services::extraction::UNKNOWN_WINE.to_string()),
        year,
        match_method: method,
        confidence: hit.similarity,
    };

    Ok(JobResolution {
        processed: serde_json::to_value(&processed).at(Stage::Upserting)?,
        method: Some(method),
    })
}

/// Tasting creation is best-effort: the wine data is already durable, so a
/// missing tasting must not fail the job.
async fn record_tasting(state: &AppState, job: &ScanJob, vintage_id: Uuid, notes: &str) {
    let tasted_at = match job.scan_id {
        Some(scan_id) => job_queries::scan_created_at(&state.db, scan_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(Utc::now),
        None => Utc::now(),
    };

    if let Err(e) = catalog_queries::create_tasting(
        &state.db,
        job.user_id,
        vintage_id,
        notes,
        tasted_at,
        &job.image_url,
    )
    .await
    {
        warn!(job_id = %job.id, error = %e, "Failed to create tasting, continuing");
    }
}

async fn record_scan_metadata(state: &AppState, job: &ScanJob, method: MatchMethod, confidence: f64) {
    if let Some(scan_id) = job.scan_id {
        if let Err(e) =
            job_queries::update_scan_resolution(&state.db, scan_id, method, confidence).await
        {
            warn!(job_id = %job.id, error = %e, "Failed to update scan metadata");
        }
    }
}

/// Queue embedding generation and push the visual embedding to the search
/// index so this label is matchable next time. Both are best-effort.
async fn queue_embedding(state: &AppState, job: &ScanJob, wine_id: Uuid, vintage_id: Uuid) {
    let Some(scan_id) = job.scan_id else {
        return;
    };

    let request = IndexImageRequest {
        scan_id,
        image_url: job.image_url.clone(),
        wine_id,
        vintage_id,
    };

    if let Err(e) = catalog_queries::enqueue_embedding(&state.db, &request).await {
        warn!(job_id = %job.id, error = %e, "Failed to enqueue embedding generation");
    }
    if let Err(e) = state.matcher.index_image(&request).await {
        warn!(job_id = %job.id, error = %e, "Failed to store visual embedding");
    }
}

/// Query string for the post-extraction text match pass.
pub fn compose_identity_query(data: &ExtractedWineData) -> String {
    let mut query = format!("{} {}", data.producer, data.wine_name);
    if let Some(year) = data.year {
        query.push(' ');
        query.push_str(&year.to_string());
    }
    query
}

/// Auto-composed tasting notes from whatever region/varietal data resolved.
pub fn compose_tasting_notes(
    region: Option<&str>,
    country: Option<&str>,
    varietals: &[String],
) -> String {
    let mut parts = Vec::new();
    if !varietals.is_empty() {
        parts.push(format!("Varietals: {}.", varietals.join(", ")));
    }
    match (region, country) {
        (Some(region), Some(country)) => parts.push(format!("Region: {region}, {country}.")),
        (Some(region), None) => parts.push(format!("Region: {region}.")),
        (None, Some(country)) => parts.push(format!("Country: {country}.")),
        (None, None) => {}
    }
    if parts.is_empty() {
        "Added from a label scan.".to_string()
    } else {
        parts.join(" ")
    }
}
