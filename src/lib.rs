//! Wine Label Resolution Pipeline
//!
//! This library turns photographed wine labels into normalized catalog rows
//! and tastings. Scan jobs are claimed from a Postgres-backed queue and run
//! through a tiered matching strategy (visual embedding, text embedding,
//! vision-model extraction, knowledge-base enrichment) before an idempotent
//! catalog upsert records the wine without creating duplicates under
//! concurrent submissions.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
