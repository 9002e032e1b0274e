//! GCE metadata server credentials.
//!
//! Works on Cloud Run, GCE, and GKE with the metadata server enabled.
//! Access tokens authorize calls to the storage API; identity tokens
//! authorize calls to other Cloud Run services. Both are cached until
//! shortly before they expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const METADATA_BASE: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default";

/// Tokens are refreshed this long before the server says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Identity tokens are valid for an hour; we don't parse the JWT.
const IDENTITY_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

impl CachedToken {
    fn fresh(&self) -> Option<SecretString> {
        (Instant::now() < self.refresh_at).then(|| self.token.clone())
    }
}

/// Caching client for the metadata server.
pub struct MetadataClient {
    http: reqwest::Client,
    base: String,
    access: Mutex<Option<CachedToken>>,
    identity: Mutex<HashMap<String, CachedToken>>,
}

impl MetadataClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base(http, METADATA_BASE)
    }

    /// Point at a different metadata endpoint (tests, emulators).
    pub fn with_base(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
            access: Mutex::new(None),
            identity: Mutex::new(HashMap::new()),
        }
    }

    /// OAuth2 access token for the default service account.
    pub async fn access_token(&self) -> Result<SecretString> {
        let mut cached = self.access.lock().await;
        if let Some(token) = cached.as_ref().and_then(CachedToken::fresh) {
            return Ok(token);
        }

        let response = self
            .http
            .get(format!("{}/token", self.base))
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "metadata access token request failed (status={status}): {body}"
            )));
        }
        let parsed: AccessTokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_MARGIN);
        let token = SecretString::from(parsed.access_token);
        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token)
    }

    /// OIDC identity token whose audience is `audience`.
    pub async fn identity_token(&self, audience: &str) -> Result<SecretString> {
        let mut cache = self.identity.lock().await;
        if let Some(token) = cache.get(audience).and_then(CachedToken::fresh) {
            return Ok(token);
        }

        let mut url = reqwest::Url::parse(&format!("{}/identity", self.base))
            .map_err(|e| Error::Config(format!("invalid metadata identity URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("audience", audience)
            .append_pair("format", "full");

        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "metadata identity token request failed (status={status}): {body}"
            )));
        }
        let token = SecretString::from(response.text().await?.trim().to_string());
        cache.insert(
            audience.to_string(),
            CachedToken {
                token: token.clone(),
                refresh_at: Instant::now() + IDENTITY_TOKEN_LIFETIME,
            },
        );
        Ok(token)
    }
}

/// Render a token as an `Authorization` header value.
pub fn bearer(token: &SecretString) -> String {
    format!("Bearer {}", token.expose_secret())
}
