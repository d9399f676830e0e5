use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Which tier of the matching strategy resolved a scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchMethod {
    /// Nearest neighbor on the label image embedding index.
    VisualEmbedding,
    /// Nearest neighbor / full-text hit on the OCR or extracted text index.
    VectorIdentity,
    /// Structured extraction via the vision model.
    OpenaiVision,
}

/// An accepted nearest-neighbor hit from the label search service.
///
/// Only returned when the service-reported similarity clears the configured
/// threshold for the index that was queried.
#[derive(Debug, Clone)]
pub struct LabelMatch {
    pub wine_id: Uuid,
    pub vintage_id: Option<Uuid>,
    pub producer_name: Option<String>,
    pub wine_name: Option<String>,
    pub similarity: f64,
}

/// Aggregate result of one batch invocation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub visual_matches: usize,
    pub vector_matches: usize,
    pub openai_matches: usize,
}

impl BatchSummary {
    pub fn record_method(&mut self, method: MatchMethod) {
        match method {
            MatchMethod::VisualEmbedding => self.visual_matches += 1,
            MatchMethod::VectorIdentity => self.vector_matches += 1,
            MatchMethod::OpenaiVision => self.openai_matches += 1,
        }
    }
}
