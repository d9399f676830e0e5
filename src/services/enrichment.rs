use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::wine::ExtractedWineData;
use crate::services::extraction::normalize_year;
use crate::services::inference::{ChatJsonRequest, InferenceClient};

const MAX_TOKENS: u32 = 512;

/// Fills gaps in extracted wine data from the model's knowledge base.
///
/// Strictly additive and strictly best-effort: populated fields are never
/// overwritten, and any failure hands back the input unchanged.
pub struct EnrichmentEngine {
    client: Arc<dyn InferenceClient>,
    model: String,
}

impl EnrichmentEngine {
    pub fn new(client: Arc<dyn InferenceClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }

    pub async fn enrich(&self, data: ExtractedWineData) -> ExtractedWineData {
        if !needs_enrichment(&data) {
            debug!(wine = %data.wine_name, "Extraction already complete, skipping enrichment");
            return data;
        }

        let request = ChatJsonRequest {
            model: self.model.clone(),
            system: "You are a wine knowledge base. Answer only with valid JSON.".to_string(),
            user_text: format!(
                "For the wine \"{}\" by \"{}\", fill in whichever of these you know: \
                 year, varietals (array of grape names), region, country, producer_website, \
                 producer_address, producer_city, producer_postal_code, latitude, longitude. \
                 Respond with a JSON object using those field names; use null when unsure.",
                data.wine_name, data.producer
            ),
            image_url: None,
            max_tokens: MAX_TOKENS,
        };

        match self.client.complete_json(&request).await {
            Ok(raw) => merge_additive(data, &raw),
            Err(e) => {
                warn!(error = %e, "Enrichment call failed, keeping extracted data as-is");
                data
            }
        }
    }
}

/// Enrichment is skipped when everything it could add is already present.
pub fn needs_enrichment(data: &ExtractedWineData) -> bool {
    let location_known = data.latitude.is_some() || data.producer_address.is_some();
    !(data.year.is_some()
        && !data.varietals.is_empty()
        && data.region.is_some()
        && data.country.is_some()
        && data.producer_website.is_some()
        && location_known)
}

/// Copy fields from the knowledge response into `data`, only where `data` has
/// nothing yet.
pub fn merge_additive(mut data: ExtractedWineData, raw: &Value) -> ExtractedWineData {
    if data.year.is_none() {
        data.year = normalize_year(&raw["year"]);
    }
    if data.varietals.is_empty() {
        if let Some(items) = raw["varietals"].as_array() {
            data.varietals = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    merge_string(&mut data.region, &raw["region"]);
    merge_string(&mut data.country, &raw["country"]);
    merge_string(&mut data.producer_website, &raw["producer_website"]);
    merge_string(&mut data.producer_address, &raw["producer_address"]);
    merge_string(&mut data.producer_city, &raw["producer_city"]);
    merge_string(&mut data.producer_postal_code, &raw["producer_postal_code"]);
    if data.latitude.is_none() {
        data.latitude = raw["latitude"].as_f64();
    }
    if data.longitude.is_none() {
        data.longitude = raw["longitude"].as_f64();
    }
    data
}

fn merge_string(slot: &mut Option<String>, value: &Value) {
    if slot.is_none() {
        *slot = value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
}
