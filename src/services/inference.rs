use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// A chat-completion request expecting a JSON object back.
#[derive(Debug, Clone)]
pub struct ChatJsonRequest {
    pub model: String,
    pub system: String,
    pub user_text: String,
    /// When set, sent as an image content part alongside the text.
    pub image_url: Option<String>,
    pub max_tokens: u32,
}

/// Vision-capable chat model behind an OpenAI-style API.
///
/// A trait so the extraction and enrichment engines take a fake in tests
/// (canned responses, call counting) instead of a live endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete_json(&self, request: &ChatJsonRequest) -> Result<Value, InferenceError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(InferenceError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    async fn complete_json(&self, request: &ChatJsonRequest) -> Result<Value, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);

        let user_content = match &request.image_url {
            Some(image_url) => json!([
                { "type": "text", "text": request.user_text },
                { "type": "image_url", "image_url": { "url": image_url } },
            ]),
            None => json!(request.user_text),
        };

        let body = json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
            "response_format": { "type": "json_object" },
            "max_tokens": request.max_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(InferenceError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let payload: Value = response.json().await.map_err(InferenceError::Http)?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| InferenceError::MalformedResponse("missing message content".into()))?;

        serde_json::from_str(content).map_err(InferenceError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request to inference endpoint failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference endpoint returned {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("inference response was not the expected shape: {0}")]
    MalformedResponse(String),

    #[error("model output was not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
