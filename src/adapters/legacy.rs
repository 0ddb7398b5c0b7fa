//! Legacy REST sink: `POST {filename, transcription, user}` with a bearer key.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DeliveryDocument, DeliveryReceipt, DownstreamSink, SinkError};

#[derive(Clone, Serialize, Deserialize)]
pub struct LegacyRestSettings {
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "guest".to_string()
}

impl Default for LegacyRestSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            user: default_user(),
        }
    }
}

impl std::fmt::Debug for LegacyRestSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyRestSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct LegacyPayload<'a> {
    filename: &'a str,
    transcription: &'a str,
    user: &'a str,
}

pub struct LegacyRestSink {
    settings: LegacyRestSettings,
    client: reqwest::Client,
}

impl LegacyRestSink {
    pub fn new(settings: LegacyRestSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }
}

#[async_trait]
impl DownstreamSink for LegacyRestSink {
    fn name(&self) -> &str {
        "legacy_rest"
    }

    fn is_configured(&self) -> bool {
        self.settings.api_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError> {
        let url = self
            .settings
            .api_url
            .as_deref()
            .ok_or(SinkError::NotConfigured("legacy api url"))?;

        let payload = LegacyPayload {
            filename: &document.filename,
            transcription: &document.body,
            user: &self.settings.user,
        };

        let mut request = self.client.post(url).json(&payload);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // The legacy API has no stable id field; accept `id` if present
        let document_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("id").map(|id| id.to_string().trim_matches('"').to_string()));

        Ok(DeliveryReceipt { document_id })
    }
}
