use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{channel::ContentEnhancer, error::ChannelError};

/// Enhancer used when no enhancement service is configured.
pub struct PassthroughEnhancer;

#[async_trait]
impl ContentEnhancer for PassthroughEnhancer {
    async fn enhance(&self, text: &str) -> Result<String, ChannelError> {
        Ok(text.to_string())
    }
}

/// Run `enhancer` over `raw`, falling back to `raw` on error, blank output,
/// or when `limit` elapses.
///
/// Enhancement never blocks delivery: every failure mode collapses to the
/// original text.
pub async fn enhance_or_raw(enhancer: &dyn ContentEnhancer, raw: &str, limit: Duration) -> String {
    match tokio::time::timeout(limit, enhancer.enhance(raw)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => text,
        Ok(Ok(_)) => {
            debug!("enhancer returned empty text, using raw content");
            raw.to_string()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "content enhancement failed, using raw content");
            raw.to_string()
        }
        Err(_) => {
            warn!(limit_ms = limit.as_millis() as u64, "content enhancement timed out, using raw content");
            raw.to_string()
        }
    }
}
