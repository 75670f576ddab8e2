use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use opora_core::config::LlmConfig;

use crate::error::{LlmError, Result};
use crate::limiter::RateLimiter;
use crate::prompts;

/// An image passed to a vision-capable call.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// OpenAI-compatible chat + embeddings client.
///
/// All calls go through the shared token-bucket limiter; every request
/// carries the configured timeout.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embed_model: String,
    embed_dim: usize,
    limiter: RateLimiter,
}

impl LlmClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            chat_model: cfg.chat_model.clone(),
            embed_model: cfg.embed_model.clone(),
            embed_dim: cfg.embed_dim,
            limiter: RateLimiter::new(cfg.calls_per_second, cfg.burst),
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// One chat completion returning the raw assistant text.
    ///
    /// `images` become data-URL content blocks on the user turn; with no
    /// images the user turn is sent as a plain string.
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        images: &[ImageData],
        json_mode: bool,
    ) -> Result<String> {
        self.limiter.acquire().await;

        let user_content = if images.is_empty() {
            json!(user)
        } else {
            let mut parts = vec![json!({"type": "text", "text": user})];
            for img in images {
                let b64 = base64::engine::general_purpose::STANDARD.encode(&img.bytes);
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", img.mime, b64)}
                }));
            }
            json!(parts)
        };

        let mut body = json!({
            "model": self.chat_model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
            "max_tokens": 1024,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %self.chat_model, json_mode, "chat completion request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(LlmError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "LLM API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let content = api
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(content)
    }

    /// JSON-schema call with the retry-once-on-parse policy: a reply that
    /// does not deserialize triggers exactly one re-ask; a second failure
    /// surfaces as `Parse`.
    pub async fn chat_json<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        images: &[ImageData],
    ) -> Result<T> {
        let first = self.chat(system, user, images, true).await?;
        match parse_json_reply::<T>(&first) {
            Ok(v) => Ok(v),
            Err(first_err) => {
                debug!(error = %first_err, "schema parse failed, re-asking once");
                let retry_user = format!("{}{}", user, prompts::RETRY_SUFFIX);
                let second = self.chat(system, &retry_user, images, true).await?;
                parse_json_reply::<T>(&second).map_err(LlmError::Parse)
            }
        }
    }

    /// Text embedding of fixed dimension.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.limiter.acquire().await;

        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({"model": self.embed_model, "input": text});
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }
        let api: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let vector = api
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(LlmError::EmptyCompletion)?;
        if vector.len() != self.embed_dim {
            return Err(LlmError::Parse(format!(
                "embedding dimension {} != configured {}",
                vector.len(),
                self.embed_dim
            )));
        }
        Ok(vector)
    }
}

/// Parse a JSON reply, tolerating a fenced ```json block around it.
pub(crate) fn parse_json_reply<T: DeserializeOwned>(
    content: &str,
) -> std::result::Result<T, String> {
    let stripped = strip_code_fences(content);
    serde_json::from_str::<T>(stripped).map_err(|e| e.to_string())
}

fn strip_code_fences(s: &str) -> &str {
    let t = s.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    let t = t.strip_suffix("```").unwrap_or(t);
    t.trim()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        ok: bool,
    }

    #[test]
    fn parse_plain_json() {
        let p: Probe = parse_json_reply(r#"{"ok": true}"#).unwrap();
        assert!(p.ok);
    }

    #[test]
    fn parse_fenced_json() {
        let p: Probe = parse_json_reply("```json\n{\"ok\": true}\n```").unwrap();
        assert!(p.ok);
    }

    #[test]
    fn parse_rejects_prose() {
        assert!(parse_json_reply::<Probe>("Sure! The answer is yes.").is_err());
    }
}
