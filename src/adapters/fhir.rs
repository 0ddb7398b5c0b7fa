//! Clinical-document (FHIR DocumentReference) sink.
//!
//! Obtains an OAuth2 token (password or client-credentials grant), caches it
//! until 30 seconds before expiry, and posts one `DocumentReference` per
//! transcript with the text as a base64 `text/plain` attachment. A 401 forces
//! one token refresh and one repost.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeliveryDocument, DeliveryReceipt, DownstreamSink, SinkError};

const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);
/// Upper bound on a cached token's lifetime, whatever the server claims
const MAX_TOKEN_LIFETIME_SECS: u64 = 86_400;
const DEFAULT_SCOPES: &str =
    "openid profile site:default user/DocumentReference.read user/DocumentReference.$docref user/Patient.read";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    #[default]
    Password,
    ClientCredentials,
}

/// Clinical-document API configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ClinicalDocumentSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_site")]
    pub site: String,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub grant_type: GrantType,

    #[serde(default)]
    pub scopes: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_site() -> String {
    "default".to_string()
}
fn default_timeout() -> u64 {
    30
}

impl Default for ClinicalDocumentSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            site: default_site(),
            client_id: None,
            client_secret: None,
            username: None,
            password: None,
            grant_type: GrantType::default(),
            scopes: None,
            timeout_seconds: default_timeout(),
        }
    }
}

impl std::fmt::Debug for ClinicalDocumentSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClinicalDocumentSettings")
            .field("base_url", &self.base_url)
            .field("site", &self.site)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("grant_type", &self.grant_type)
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl ClinicalDocumentSettings {
    /// Fully configured for the selected grant
    pub fn is_configured(&self) -> bool {
        let base = self.base_url.as_deref().is_some_and(|u| !u.is_empty());
        let client = self.client_id.is_some() && self.client_secret.is_some();
        let user = match self.grant_type {
            GrantType::Password => self.username.is_some() && self.password.is_some(),
            GrantType::ClientCredentials => true,
        };
        base && client && user
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

fn token_expiry(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in.min(MAX_TOKEN_LIFETIME_SECS));
    now.checked_add(lifetime).unwrap_or(now)
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// FHIR DocumentReference client
pub struct ClinicalDocumentSink {
    settings: ClinicalDocumentSettings,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl ClinicalDocumentSink {
    pub fn new(settings: ClinicalDocumentSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            settings,
            client,
            token: Mutex::new(None),
        }
    }

    fn base_url(&self) -> Result<&str, SinkError> {
        self.settings
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .ok_or(SinkError::NotConfigured("clinical document base url"))
    }

    fn token_url(&self) -> Result<String, SinkError> {
        Ok(format!("{}/oauth2/{}/token", self.base_url()?, self.settings.site))
    }

    fn document_url(&self) -> Result<String, SinkError> {
        Ok(format!(
            "{}/apis/{}/fhir/DocumentReference",
            self.base_url()?,
            self.settings.site
        ))
    }

    /// Cached token, or a fresh one when `force` or within the expiry skew
    async fn access_token(&self, force: bool) -> Result<String, SinkError> {
        let mut cached = self.token.lock().await;
        if !force {
            if let Some(token) = cached.as_ref() {
                if Instant::now() + TOKEN_EXPIRY_SKEW < token.expires_at {
                    return Ok(token.token.clone());
                }
            }
        }

        let fresh = self.fetch_token().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<CachedToken, SinkError> {
        let client_id = self
            .settings
            .client_id
            .clone()
            .ok_or(SinkError::NotConfigured("client id"))?;
        let scope = self
            .settings
            .scopes
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPES.to_string());

        let mut form = vec![
            ("client_id", client_id.clone()),
            ("scope", scope),
        ];
        match self.settings.grant_type {
            GrantType::ClientCredentials => {
                form.push(("grant_type", "client_credentials".to_string()));
            }
            GrantType::Password => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", self.settings.username.clone().unwrap_or_default()));
                form.push(("password", self.settings.password.clone().unwrap_or_default()));
                form.push(("user_role", "users".to_string()));
            }
        }

        let response = self
            .client
            .post(self.token_url()?)
            .basic_auth(client_id, self.settings.client_secret.clone())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(SinkError::Auth(format!("token endpoint returned {}", status)));
        }

        let body: TokenResponse = response.json().await?;
        let token = body
            .access_token
            .ok_or_else(|| SinkError::Auth("no access_token in response".to_string()))?;
        debug!(expires_in = body.expires_in, "clinical document token refreshed");

        Ok(CachedToken {
            token,
            expires_at: token_expiry(Instant::now(), body.expires_in),
        })
    }

    fn resource(document: &DeliveryDocument) -> serde_json::Value {
        serde_json::json!({
            "resourceType": "DocumentReference",
            "status": "current",
            "docStatus": "final",
            "type": {"text": "Clinical Transcription"},
            "description": document.filename,
            "content": [{
                "attachment": {
                    "contentType": "text/plain",
                    "language": "en",
                    "data": STANDARD.encode(document.body.as_bytes()),
                    "title": document.filename,
                }
            }]
        })
    }

    async fn post(&self, resource: &serde_json::Value, token: &str) -> Result<reqwest::Response, SinkError> {
        Ok(self
            .client
            .post(self.document_url()?)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/fhir+json")
            .json(resource)
            .send()
            .await?)
    }
}

#[async_trait]
impl DownstreamSink for ClinicalDocumentSink {
    fn name(&self) -> &str {
        "clinical_document"
    }

    fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }

    async fn deliver(&self, document: &DeliveryDocument) -> Result<DeliveryReceipt, SinkError> {
        let resource = Self::resource(document);
        let token = self.access_token(false).await?;
        let mut response = self.post(&resource, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("clinical document API rejected token; refreshing once");
            let token = self.access_token(true).await?;
            response = self.post(&resource, &token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreatedResource = response.json().await?;
        Ok(DeliveryReceipt {
            document_id: created.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ClinicalDocumentSettings {
        ClinicalDocumentSettings {
            base_url: Some("http://emr.local/".into()),
            site: default_site(),
            client_id: Some("cid".into()),
            client_secret: Some("secret".into()),
            username: Some("user".into()),
            password: Some("pass".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_configuration_depends_on_grant() {
        let mut settings = configured();
        assert!(settings.is_configured());

        settings.password = None;
        assert!(!settings.is_configured());

        settings.grant_type = GrantType::ClientCredentials;
        assert!(settings.is_configured());

        settings.base_url = None;
        assert!(!settings.is_configured());
    }

    #[test]
    fn test_urls_trim_trailing_slash() {
        let sink = ClinicalDocumentSink::new(configured());
        assert_eq!(sink.token_url().unwrap(), "http://emr.local/oauth2/default/token");
        assert_eq!(
            sink.document_url().unwrap(),
            "http://emr.local/apis/default/fhir/DocumentReference"
        );
    }

    #[test]
    fn test_resource_carries_base64_attachment() {
        let doc = DeliveryDocument {
            filename: "a.wav".into(),
            body: "hello".into(),
        };
        let resource = ClinicalDocumentSink::resource(&doc);
        let attachment = &resource["content"][0]["attachment"];

        assert_eq!(resource["resourceType"], "DocumentReference");
        assert_eq!(attachment["contentType"], "text/plain");
        assert_eq!(attachment["data"], STANDARD.encode("hello"));
    }

    #[test]
    fn test_huge_expires_in_is_clamped() {
        let now = Instant::now();
        let expiry = token_expiry(now, u64::MAX);
        assert_eq!(expiry - now, Duration::from_secs(MAX_TOKEN_LIFETIME_SECS));
        assert_eq!(token_expiry(now, 60) - now, Duration::from_secs(60));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", configured());
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("pass"));
    }
}
