use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::models::matching::LabelMatch;

/// Request to store a resolved scan's image embedding for future visual hits.
#[derive(Debug, Clone, Serialize)]
pub struct IndexImageRequest {
    pub scan_id: Uuid,
    pub image_url: String,
    pub wine_id: Uuid,
    pub vintage_id: Uuid,
}

/// Nearest-neighbor lookups against the label search service.
///
/// Trait seam so the pipeline is testable with canned hits and misses.
#[async_trait]
pub trait LabelMatcher: Send + Sync {
    /// Query the image-embedding index. `None` is a miss or a below-threshold hit.
    async fn match_image(&self, image_url: &str) -> Result<Option<LabelMatch>, SearchError>;

    /// Query the text index (OCR text first pass, composed identity second pass).
    async fn match_text(&self, text: &str) -> Result<Option<LabelMatch>, SearchError>;

    /// Store the visual embedding of a freshly resolved scan.
    async fn index_image(&self, request: &IndexImageRequest) -> Result<(), SearchError>;
}

/// HTTP client for the label search service's two logical indices.
pub struct LabelSearchClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    visual_threshold: f64,
    text_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    matched: bool,
    wine_id: Option<Uuid>,
    vintage_id: Option<Uuid>,
    producer_name: Option<String>,
    wine_name: Option<String>,
    similarity: Option<f64>,
}

impl LabelSearchClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        visual_threshold: f64,
        text_threshold: f64,
    ) -> Result<Self, SearchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(SearchError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            visual_threshold,
            text_threshold,
        })
    }

    async fn query(
        &self,
        path: &str,
        body: &serde_json::Value,
        threshold: f64,
    ) -> Result<Option<LabelMatch>, SearchError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(SearchError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let hit: MatchResponse = response.json().await.map_err(SearchError::Http)?;
        if !hit.matched {
            return Ok(None);
        }

        let similarity = hit.similarity.unwrap_or(0.0);
        let wine_id = match hit.wine_id {
            Some(id) => id,
            None => return Ok(None),
        };

        if similarity < threshold {
            debug!(path, similarity, threshold, "Search hit below threshold, treating as miss");
            return Ok(None);
        }

        Ok(Some(LabelMatch {
            wine_id,
            vintage_id: hit.vintage_id,
            producer_name: hit.producer_name,
            wine_name: hit.wine_name,
            similarity,
        }))
    }
}

#[async_trait]
impl LabelMatcher for LabelSearchClient {
    async fn match_image(&self, image_url: &str) -> Result<Option<LabelMatch>, SearchError> {
        self.query(
            "/match/image",
            &serde_json::json!({ "image_url": image_url }),
            self.visual_threshold,
        )
        .await
    }

    async fn match_text(&self, text: &str) -> Result<Option<LabelMatch>, SearchError> {
        self.query(
            "/match/text",
            &serde_json::json!({ "text": text }),
            self.text_threshold,
        )
        .await
    }

    async fn index_image(&self, request: &IndexImageRequest) -> Result<(), SearchError> {
        let mut req = self
            .http
            .post(format!("{}/index/image", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(SearchError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP request to search service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search service returned {status}: {detail}")]
    Api { status: u16, detail: String },
}
