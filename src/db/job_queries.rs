use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{JobStatus, ScanJob};
use crate::models::matching::MatchMethod;

/// Retry ceiling: a job whose retry count exceeds this is terminally failed.
pub const MAX_RETRIES: i32 = 3;

const JOB_COLUMNS: &str = "id, user_id, image_url, ocr_text, scan_id, idempotency_key, \
                           retry_count, status, processed_data, error_message, \
                           created_at, updated_at";

fn row_to_job(row: &PgRow) -> Result<ScanJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    Ok(ScanJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        image_url: row.try_get("image_url")?,
        ocr_text: row.try_get("ocr_text")?,
        scan_id: row.try_get("scan_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        retry_count: row.try_get("retry_count")?,
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Pending),
        processed_data: row.try_get("processed_data")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new scan job (upload flow / tests).
pub async fn create_job(
    pool: &PgPool,
    user_id: Uuid,
    image_url: &str,
    ocr_text: Option<&str>,
    scan_id: Option<Uuid>,
) -> Result<ScanJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO scan_jobs (user_id, image_url, ocr_text, scan_id, status)
        VALUES ($1, $2, $3, $4, 'pending')
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(user_id)
    .bind(image_url)
    .bind(ocr_text)
    .bind(scan_id)
    .fetch_one(pool)
    .await?;

    row_to_job(&row)
}

/// Atomically claim up to `limit` pending jobs, transitioning them to
/// `working`. `FOR UPDATE SKIP LOCKED` guarantees that concurrent
/// orchestrator invocations never lease the same row.
pub async fn claim_pending_jobs(pool: &PgPool, limit: i64) -> Result<Vec<ScanJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        UPDATE scan_jobs
        SET status = 'working', updated_at = NOW()
        WHERE id IN (
            SELECT id FROM scan_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_job).collect()
}

/// Persist a freshly computed idempotency key on the job.
pub async fn set_idempotency_key(
    pool: &PgPool,
    job_id: Uuid,
    key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scan_jobs SET idempotency_key = $1, updated_at = NOW() WHERE id = $2")
        .bind(key)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Find another completed job sharing this idempotency key and return its
/// processed data, if any. Used to short-circuit duplicate submissions.
pub async fn find_completed_duplicate(
    pool: &PgPool,
    key: &str,
    exclude_job_id: Uuid,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT processed_data
        FROM scan_jobs
        WHERE idempotency_key = $1
          AND status = 'completed'
          AND id <> $2
          AND processed_data IS NOT NULL
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .bind(key)
    .bind(exclude_job_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => r.try_get("processed_data")?,
        None => None,
    })
}

/// Mark a job completed with its resolution payload.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    processed_data: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE scan_jobs
        SET status = 'completed', processed_data = $1, error_message = NULL, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(processed_data)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a job failure: bump the retry count and route the job back to
/// `pending` while under the ceiling, or to terminal `failed` past it.
/// Returns the status the job landed in.
pub async fn record_failure(
    pool: &PgPool,
    job_id: Uuid,
    error_message: &str,
) -> Result<(JobStatus, i32), sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE scan_jobs
        SET retry_count = retry_count + 1,
            status = CASE WHEN retry_count + 1 > $1 THEN 'failed' ELSE 'pending' END,
            error_message = $2,
            updated_at = NOW()
        WHERE id = $3
        RETURNING status, retry_count
        "#,
    )
    .bind(MAX_RETRIES)
    .bind(error_message)
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed);
    Ok((status, row.try_get("retry_count")?))
}

/// Get a job by ID (polling clients).
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ScanJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1",
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Number of jobs waiting to be claimed (queue-depth gauge).
pub async fn pending_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM scan_jobs WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    row.try_get("n")
}

/// Record which match method resolved a job (analytics, redundancy skipping).
pub async fn record_scan_match(
    pool: &PgPool,
    job_id: Uuid,
    method: MatchMethod,
    confidence: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO scan_matches (job_id, method, confidence)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO UPDATE
        SET method = EXCLUDED.method, confidence = EXCLUDED.confidence
        "#,
    )
    .bind(job_id)
    .bind(method.to_string())
    .bind(confidence)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write match metadata back onto the originating scan row.
pub async fn update_scan_resolution(
    pool: &PgPool,
    scan_id: Uuid,
    method: MatchMethod,
    confidence: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE scans SET match_method = $1, match_confidence = $2 WHERE id = $3",
    )
    .bind(method.to_string())
    .bind(confidence)
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Creation date of the originating scan, used as the default tasting date.
pub async fn scan_created_at(
    pool: &PgPool,
    scan_id: Uuid,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let row = sqlx::query("SELECT created_at FROM scans WHERE id = $1")
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(r) => Some(r.try_get("created_at")?),
        None => None,
    })
}
