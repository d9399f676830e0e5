use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    enrichment::EnrichmentEngine,
    extraction::ExtractionEngine,
    vector_search::LabelMatcher,
};

/// Shared application state passed to route handlers and the pipeline.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub matcher: Arc<dyn LabelMatcher>,
    pub extraction: Arc<ExtractionEngine>,
    pub enrichment: Arc<EnrichmentEngine>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        matcher: Arc<dyn LabelMatcher>,
        extraction: ExtractionEngine,
        enrichment: EnrichmentEngine,
    ) -> Self {
        Self {
            db,
            matcher,
            extraction: Arc::new(extraction),
            enrichment: Arc::new(enrichment),
        }
    }
}
