use async_trait::async_trait;
use chime_channels::{ChannelError, LineTransport};
use chime_core::config::LineConfig;
use tracing::{debug, warn};

/// LINE Messaging API push client.
pub struct LinePushClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl LinePushClient {
    pub fn new(config: &LineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: config.channel_access_token.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LineTransport for LinePushClient {
    async fn push(&self, room_id: &str, message: &str) -> Result<(), ChannelError> {
        let url = format!("{}/v2/bot/message/push", self.base_url);
        debug!(%room_id, "pushing LINE message");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&build_push_body(room_id, message))
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "LINE push rejected");
            return Err(ChannelError::SendFailed(format!("LINE API {status}: {text}")));
        }
        Ok(())
    }
}

/// Stand-in used when no channel access token is configured.
pub struct UnconfiguredLine;

#[async_trait]
impl LineTransport for UnconfiguredLine {
    async fn push(&self, _room_id: &str, _message: &str) -> Result<(), ChannelError> {
        Err(ChannelError::ConfigError(
            "LINE channel access token not configured".to_string(),
        ))
    }
}

// LINE rejects text messages longer than 5000 characters.
const MAX_TEXT_CHARS: usize = 5000;

fn build_push_body(room_id: &str, message: &str) -> serde_json::Value {
    let text: String = message.chars().take(MAX_TEXT_CHARS).collect();
    serde_json::json!({
        "to": room_id,
        "messages": [{ "type": "text", "text": text }],
    })
}
