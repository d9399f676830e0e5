pub mod enrichment;
pub mod extraction;
pub mod idempotency;
pub mod inference;
pub mod pipeline;
pub mod vector_search;
