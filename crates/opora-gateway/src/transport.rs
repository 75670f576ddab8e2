//! HTTP clients for the two external collaborators: the chat transport
//! adapter (outbound sends, group listing) and the history-bootstrap
//! service (link-token delivery).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use opora_agent::{HistoryNotifier, Transport, TransportError};
use opora_core::config::{HistoryConfig, TransportConfig};
use opora_core::types::GroupId;

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(cfg: &TransportConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(cfg.timeout_ms))
                .build()?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    id: String,
    name: String,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_group_text(
        &self,
        group_id: &GroupId,
        text: &str,
        quote_message_id: Option<&str>,
        mention_recipients: &[String],
    ) -> Result<bool, TransportError> {
        let body = json!({
            "group_id": group_id.as_str(),
            "text": text,
            "quote_message_id": quote_message_id,
            "mentions": mention_recipients,
        });
        debug!(group = %group_id, "sending group message");
        let resp = self
            .request(reqwest::Method::POST, "/send/group")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "group send rejected by adapter");
            return Ok(false);
        }
        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(parsed.ok)
    }

    async fn send_direct_text(
        &self,
        admin_id: &str,
        text: &str,
        attachment_png: Option<&[u8]>,
    ) -> Result<bool, TransportError> {
        let body = json!({
            "recipient": admin_id,
            "text": text,
            "attachment_png_base64": attachment_png
                .map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
        });
        let resp = self
            .request(reqwest::Method::POST, "/send/direct")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let parsed: SendResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(parsed.ok)
    }

    async fn list_groups(&self) -> Result<Vec<(GroupId, String)>, TransportError> {
        let resp = self
            .request(reqwest::Method::GET, "/groups")
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Unavailable(format!(
                "group listing failed: {}",
                resp.status()
            )));
        }
        let rows: Vec<GroupRow> = resp
            .json()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (GroupId::from(r.id), r.name))
            .collect())
    }
}

pub struct HttpHistoryNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryNotifier {
    pub fn new(cfg: &HistoryConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?,
            base_url: cfg.service_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HistoryNotifier for HttpHistoryNotifier {
    async fn deliver_link_token(
        &self,
        token: &str,
        group_id: &GroupId,
        qr_hint: &str,
    ) -> Result<(), TransportError> {
        if self.base_url.is_empty() {
            // Collaborator not configured: the token stays usable, the
            // operator can hand it over manually.
            warn!("history service not configured, skipping link-token delivery");
            return Ok(());
        }
        let body = json!({
            "token": token,
            "group_id": group_id.as_str(),
            "qr_hint": qr_hint,
        });
        let resp = self
            .client
            .post(format!("{}/history/link-token", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Unavailable(format!(
                "link-token delivery failed: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
