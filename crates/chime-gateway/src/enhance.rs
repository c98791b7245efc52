use std::time::Duration;

use async_trait::async_trait;
use chime_channels::{ChannelError, ContentEnhancer};
use chime_core::config::EnhancerConfig;
use serde::Deserialize;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "Rewrite the reminder you are given so it reads warm and clear. \
Keep the original language and every concrete detail such as times, names, places and numbers. \
Reply with the rewritten reminder only.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat-completions enhancer for any OpenAI-compatible endpoint.
pub struct OpenAiEnhancer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiEnhancer {
    pub fn new(config: &EnhancerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl ContentEnhancer for OpenAiEnhancer {
    async fn enhance(&self, text: &str) -> Result<String, ChannelError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %self.model, "requesting reminder enhancement");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&build_request_body(&self.model, text))
            .send()
            .await
            .map_err(|e| ChannelError::Enhance(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "enhancer API error");
            return Err(ChannelError::Enhance(format!("API {status}: {body}")));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Enhance(e.to_string()))?;
        first_choice_text(api_resp)
    }
}

fn build_request_body(model: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": text },
        ],
        "temperature": 0.7,
    })
}

fn first_choice_text(resp: ApiResponse) -> Result<String, ChannelError> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ChannelError::Enhance("response had no content".to_string()))
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
