//! Credentials and OAuth2 access tokens for Google APIs.
//!
//! The standing listener loads a service-account key at startup and mints
//! tokens with the JWT-bearer grant. The trigger runs on the hosting platform
//! and, unless a key is configured, asks the platform metadata server for
//! tokens instead. Either way tokens are reused until shortly before they
//! expire.

use crate::config::FirebaseSettings;
use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CREDENTIALS_BASE64_ENV: &str = "ORDER_PUSH__FIREBASE__CREDENTIALS_BASE64";
pub const GOOGLE_APPLICATION_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const SCOPES: &str =
    "https://www.googleapis.com/auth/datastore https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_MINUTES: i64 = 60;
// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_TOKEN_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_PROJECT_PATH: &str = "computeMetadata/v1/project/project-id";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("No credentials configured (set firebase.credentials_path, GOOGLE_APPLICATION_CREDENTIALS or ORDER_PUSH__FIREBASE__CREDENTIALS_BASE64)")]
    NotConfigured,
    #[error("Failed to read credentials file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to decode base64 credentials: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Malformed service account: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid service account private key: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("Token request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),
    #[error("Token endpoint rejected the assertion: {status}: {body}")]
    TokenRejected { status: u16, body: String },
    #[error("Metadata server returned {status}: {body}")]
    MetadataRejected { status: u16, body: String },
}

/// The parts of a Google service-account key file this service uses.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    /// Locates and parses the credential artifact.
    ///
    /// Sources are tried in order: `firebase.credentials_path`,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then base64 JSON in
    /// `ORDER_PUSH__FIREBASE__CREDENTIALS_BASE64`.
    pub fn load(settings: &FirebaseSettings) -> Result<Self, CredentialsError> {
        if let Some(path) = settings.credentials_path.as_deref().filter(|p| !p.is_empty()) {
            info!(path, "Loading service account from configured path");
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(GOOGLE_APPLICATION_CREDENTIALS_ENV) {
            if !path.is_empty() {
                info!(path = %path, "Loading service account from {}", GOOGLE_APPLICATION_CREDENTIALS_ENV);
                return Self::from_file(&path);
            }
        }
        if let Ok(encoded) = std::env::var(CREDENTIALS_BASE64_ENV) {
            if !encoded.is_empty() {
                info!("Loading service account from base64 environment variable");
                let json = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
                return Self::from_json(&json);
            }
        }
        Err(CredentialsError::NotConfigured)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| CredentialsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CredentialsError> {
        let key: ServiceAccountKey = serde_json::from_slice(bytes)?;
        // Reject an unusable key now rather than on the first send.
        key.encoding_key()?;
        Ok(key)
    }

    fn encoding_key(&self) -> Result<EncodingKey, CredentialsError> {
        Ok(EncodingKey::from_rsa_pem(self.private_key.as_bytes())?)
    }
}

/// Supplies bearer tokens for outgoing Google API calls.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, CredentialsError>;
}

#[cfg(test)]
pub(crate) struct StaticTokenSource(pub String);

#[cfg(test)]
#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    value: String,
    expires_at: chrono::DateTime<Utc>,
}

impl From<TokenResponse> for CachedToken {
    fn from(token: TokenResponse) -> Self {
        let lifetime = token.expires_in.unwrap_or(TOKEN_LIFETIME_MINUTES * 60);
        debug!(expires_in = lifetime, "Fetched new access token");
        CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime - EXPIRY_MARGIN_SECS),
        }
    }
}

/// Holds the current token; concurrent callers wait on one refresh.
#[derive(Default)]
struct TokenCache {
    current: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, CredentialsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, CredentialsError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(cached) = current.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.value.clone());
            }
        }
        let fresh = fetch().await?;
        let value = fresh.value.clone();
        *current = Some(fresh);
        Ok(value)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Exchanges a signed service-account assertion for an access token.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    token_url: String,
    http: reqwest::Client,
    cache: TokenCache,
}

impl ServiceAccountTokenSource {
    pub fn new(
        key: ServiceAccountKey,
        token_url: Option<String>,
        http: reqwest::Client,
    ) -> Result<Self, CredentialsError> {
        let encoding_key = key.encoding_key()?;
        let token_url = token_url.unwrap_or_else(|| key.token_uri.clone());
        Ok(Self {
            key,
            encoding_key,
            token_url,
            http,
            cache: TokenCache::default(),
        })
    }

    fn signed_assertion(&self) -> Result<String, CredentialsError> {
        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SCOPES,
            aud: &self.token_url,
            iat: now.timestamp(),
            exp: (now + Duration::minutes(TOKEN_LIFETIME_MINUTES)).timestamp(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    async fn fetch_token(&self) -> Result<CachedToken, CredentialsError> {
        let assertion = self.signed_assertion()?;
        let response = self
            .http
            .post(&self.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialsError::TokenRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into())
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        self.cache.get_or_fetch(|| self.fetch_token()).await
    }
}

/// Tokens for the runtime's default service account, read from the
/// platform metadata server.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    base_url: String,
    cache: TokenCache,
}

impl MetadataTokenSource {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: TokenCache::default(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, CredentialsError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(METADATA_FLAVOR_HEADER, "Google")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialsError::MetadataRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// The project the runtime belongs to.
    pub async fn project_id(&self) -> Result<String, CredentialsError> {
        let response = self.get(METADATA_PROJECT_PATH).await?;
        Ok(response.text().await?.trim().to_string())
    }

    async fn fetch_token(&self) -> Result<CachedToken, CredentialsError> {
        let token: TokenResponse = self.get(METADATA_TOKEN_PATH).await?.json().await?;
        Ok(token.into())
    }
}

#[async_trait]
impl AccessTokenSource for MetadataTokenSource {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        self.cache.get_or_fetch(|| self.fetch_token()).await
    }
}
