use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::matching::MatchMethod;

/// Status of a scan job in the resolution queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Working,
    Completed,
    Failed,
}

/// A label scan awaiting resolution against the catalog.
///
/// Created by the upload flow; claimed and driven to a terminal state by the
/// batch orchestrator. `processed_data` carries the resolution result for
/// polling clients and for duplicate short-circuiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_url: String,
    pub ocr_text: Option<String>,
    pub scan_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub retry_count: i32,
    pub status: JobStatus,
    pub processed_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resolution result persisted on a completed job (`processed_data`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedScan {
    pub wine_id: Uuid,
    pub vintage_id: Uuid,
    pub producer_name: String,
    pub wine_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub match_method: MatchMethod,
    pub confidence: f64,
}
