use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Base URL of the label search service (image + text vector indices)
    pub search_base_url: String,

    /// API key for the label search service
    #[serde(default)]
    pub search_api_key: Option<String>,

    /// Base URL of the OpenAI-compatible inference endpoint
    #[serde(default = "default_inference_base_url")]
    pub inference_base_url: String,

    /// API key for the inference endpoint
    pub inference_api_key: String,

    /// Model used for the first extraction pass
    #[serde(default = "default_extraction_model")]
    pub extraction_model: String,

    /// Stronger model used when first-pass confidence is below the escalation floor
    #[serde(default = "default_strong_model")]
    pub extraction_strong_model: String,

    /// Knowledge-grounded model used to fill gaps left by extraction
    #[serde(default = "default_extraction_model")]
    pub enrichment_model: String,

    /// Hosts image URLs may point at (comma-separated). SSRF allow-list:
    /// only HTTPS URLs on these hosts (or their subdomains) reach inference.
    pub allowed_image_hosts: Vec<String>,

    /// Minimum similarity for accepting an image-embedding match
    #[serde(default = "default_visual_threshold")]
    pub visual_match_threshold: f64,

    /// Minimum similarity for accepting a text match
    #[serde(default = "default_text_threshold")]
    pub text_match_threshold: f64,

    /// Worker poll interval when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bind address for the worker's Prometheus scrape endpoint
    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_extraction_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_strong_model() -> String {
    "gpt-4o".to_string()
}

fn default_visual_threshold() -> f64 {
    0.92
}

fn default_text_threshold() -> f64 {
    0.85
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_metrics_bind_addr() -> String {
    "0.0.0.0:9091".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
