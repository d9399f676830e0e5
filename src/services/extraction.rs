use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{info, warn};
use url::Url;

use crate::models::wine::ExtractedWineData;
use crate::services::inference::{ChatJsonRequest, InferenceClient, InferenceError};

/// Confidence floor below which extraction is retried once on the strong model.
const ESCALATION_FLOOR: f64 = 0.6;

/// Confidence ceiling applied when the model could not name the producer or wine.
const SENTINEL_CONFIDENCE_CAP: f64 = 0.2;

pub const UNKNOWN_PRODUCER: &str = "Unknown Producer";
pub const UNKNOWN_WINE: &str = "Unknown Wine";

const MAX_TOKENS: u32 = 1024;

fn year_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // First plausible 4-digit vintage in 1900-2029; guards against the model
    // returning ranges like "2018 or 2019".
    RE.get_or_init(|| Regex::new(r"\b(19\d{2}|20[0-2]\d)\b").unwrap())
}

fn non_vintage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\bNV\b|non[\s-]?vintage|multi[\s-]?vintage|solera|perpetual)").unwrap()
    })
}

/// NV naming heuristic: does the wine's own name declare it non-vintage?
pub fn name_is_non_vintage(wine_name: &str) -> bool {
    non_vintage_re().is_match(wine_name)
}

/// Normalize a year field that may arrive as a string, a number, or garbage.
///
/// Strings take the first 4-digit token in 1900-2029; numbers outside
/// [1900, 2025] are discarded as hallucinated.
pub fn normalize_year(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => {
            let year = n.as_i64()?;
            if (1900..=2025).contains(&year) {
                Some(year as i32)
            } else {
                None
            }
        }
        Value::String(s) => year_token_re()
            .find(s)
            .and_then(|m| m.as_str().parse::<i32>().ok()),
        _ => None,
    }
}

/// Extracts structured wine identity from a label image via the vision model,
/// escalating once to a stronger model when confidence is low.
pub struct ExtractionEngine {
    client: Arc<dyn InferenceClient>,
    model: String,
    strong_model: String,
    allowed_image_hosts: Vec<String>,
}

impl ExtractionEngine {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        model: &str,
        strong_model: &str,
        allowed_image_hosts: Vec<String>,
    ) -> Self {
        Self {
            client,
            model: model.to_string(),
            strong_model: strong_model.to_string(),
            allowed_image_hosts,
        }
    }

    /// Extract wine identity from the label image plus any OCR text.
    ///
    /// The image URL is validated against the SSRF allow-list before anything
    /// is sent to the inference endpoint.
    pub async fn extract(
        &self,
        image_url: &str,
        ocr_text: Option<&str>,
    ) -> Result<ExtractedWineData, ExtractionError> {
        self.ensure_safe_image_url(image_url)?;

        let first = self.extract_with_model(&self.model, image_url, ocr_text).await?;

        if first.confidence >= ESCALATION_FLOOR {
            return Ok(first);
        }

        info!(
            confidence = first.confidence,
            model = %self.strong_model,
            "Low extraction confidence, escalating to strong model"
        );

        // One escalation only; the strong model's answer is taken as-is.
        self.extract_with_model(&self.strong_model, image_url, ocr_text)
            .await
    }

    async fn extract_with_model(
        &self,
        model: &str,
        image_url: &str,
        ocr_text: Option<&str>,
    ) -> Result<ExtractedWineData, ExtractionError> {
        let mut user_text = String::from(
            "Identify the wine on this label. Respond with a JSON object with these fields: \
             producer, wine_name, year, country, region, varietals (array of grape names), \
             abv_percent, confidence (0.0-1.0, your certainty in the identification), \
             producer_website, producer_address, producer_city, producer_postal_code, \
             latitude, longitude. Use null for anything not visible on the label.",
        );
        if let Some(text) = ocr_text {
            if !text.is_empty() {
                user_text.push_str("\n\nOCR text read from the label:\n");
                user_text.push_str(text);
            }
        }

        let request = ChatJsonRequest {
            model: model.to_string(),
            system: "You are a sommelier identifying wines from label photographs. \
                     Answer only with valid JSON."
                .to_string(),
            user_text,
            image_url: Some(image_url.to_string()),
            max_tokens: MAX_TOKENS,
        };

        let raw = self.client.complete_json(&request).await?;
        Ok(parse_extracted(&raw))
    }

    /// SSRF guard: HTTPS only, host must be on (or under) the allow-list.
    fn ensure_safe_image_url(&self, image_url: &str) -> Result<(), ExtractionError> {
        let parsed = Url::parse(image_url)
            .map_err(|_| ExtractionError::UnsafeImageUrl(image_url.to_string()))?;

        if parsed.scheme() != "https" {
            warn!(url = %image_url, "Rejected non-HTTPS image URL");
            return Err(ExtractionError::UnsafeImageUrl(image_url.to_string()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ExtractionError::UnsafeImageUrl(image_url.to_string()))?;

        let allowed = self.allowed_image_hosts.iter().any(|allowed| {
            host.eq_ignore_ascii_case(allowed)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", allowed.to_ascii_lowercase()))
        });

        if !allowed {
            warn!(url = %image_url, host = %host, "Rejected image URL outside allow-list");
            return Err(ExtractionError::UnsafeImageUrl(image_url.to_string()));
        }

        Ok(())
    }
}

/// Convert the model's untyped JSON into typed wine data, applying the
/// sentinel defaults and year normalization rules.
pub fn parse_extracted(raw: &Value) -> ExtractedWineData {
    let producer = non_empty_string(&raw["producer"]);
    let wine_name = non_empty_string(&raw["wine_name"]);
    let sentinel = producer.is_none() || wine_name.is_none();

    let mut confidence = raw["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    if sentinel {
        confidence = confidence.min(SENTINEL_CONFIDENCE_CAP);
    }

    let varietals = raw["varietals"]
        .as_array()
        .map(|items| items.iter().filter_map(non_empty_string).collect::<Vec<_>>())
        .unwrap_or_default();

    ExtractedWineData {
        producer: producer.unwrap_or_else(|| UNKNOWN_PRODUCER.to_string()),
        wine_name: wine_name.unwrap_or_else(|| UNKNOWN_WINE.to_string()),
        year: normalize_year(&raw["year"]),
        country: non_empty_string(&raw["country"]),
        region: non_empty_string(&raw["region"]),
        varietals,
        abv_percent: raw["abv_percent"].as_f64(),
        confidence,
        producer_website: non_empty_string(&raw["producer_website"]),
        producer_address: non_empty_string(&raw["producer_address"]),
        producer_city: non_empty_string(&raw["producer_city"]),
        producer_postal_code: non_empty_string(&raw["producer_postal_code"]),
        latitude: raw["latitude"].as_f64(),
        longitude: raw["longitude"].as_f64(),
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("image URL rejected by SSRF guard: {0}")]
    UnsafeImageUrl(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}
