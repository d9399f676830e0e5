use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::job_queries;
use crate::models::matching::BatchSummary;
use crate::services::pipeline;

/// Body of POST /api/v1/scans/process. The whole body is optional.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ProcessRequest {
    #[garde(inner(range(min = 1, max = 20)))]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// POST /api/v1/scans/process — claim and resolve a batch of pending scans.
///
/// Individual job failures are routed through retry/fail and reflected in the
/// counts; only a failure to claim jobs at all produces a 500.
pub async fn process_scans(
    State(state): State<AppState>,
    body: Option<Json<ProcessRequest>>,
) -> Result<Json<BatchSummary>, (StatusCode, Json<ErrorResponse>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if let Err(report) = request.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: report.to_string(),
            }),
        ));
    }

    match pipeline::process_batch(&state, request.limit).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            error!(error = %e, "Failed to claim scan jobs");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("failed to claim jobs: {e}"),
                }),
            ))
        }
    }
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// GET /api/v1/scans/jobs/{job_id} — polling endpoint for upload clients.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = job_queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status.to_string(),
        processed_data: job.processed_data,
        error_message: job.error_message,
    }))
}
