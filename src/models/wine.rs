use garde::Validate;
use serde::{Deserialize, Serialize};

/// Structured wine identity extracted from a label image by the vision model,
/// optionally filled out further by knowledge-base enrichment.
///
/// All optional fields stay `None` when the model could not read them; the
/// enrichment pass is strictly additive and never overwrites a populated
/// field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ExtractedWineData {
    #[garde(length(min = 1, max = 200))]
    pub producer: String,

    #[garde(length(min = 1, max = 200))]
    pub wine_name: String,

    #[garde(skip)]
    pub year: Option<i32>,

    #[garde(skip)]
    pub country: Option<String>,

    #[garde(skip)]
    pub region: Option<String>,

    #[garde(skip)]
    pub varietals: Vec<String>,

    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub abv_percent: Option<f64>,

    /// Model self-reported confidence in the extraction, 0.0 - 1.0.
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(skip)]
    pub producer_website: Option<String>,

    #[garde(skip)]
    pub producer_address: Option<String>,

    #[garde(skip)]
    pub producer_city: Option<String>,

    #[garde(skip)]
    pub producer_postal_code: Option<String>,

    #[garde(skip)]
    pub latitude: Option<f64>,

    #[garde(skip)]
    pub longitude: Option<f64>,
}

impl ExtractedWineData {
    /// True when the label carries no single vintage year and the wine's name
    /// declares it as such. A missing year alone is not enough: the extractor
    /// failing to read a vintage must not mark the wine non-vintage.
    pub fn is_non_vintage(&self) -> bool {
        self.year.is_none() && crate::services::extraction::name_is_non_vintage(&self.wine_name)
    }
}
