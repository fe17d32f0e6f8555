use crate::{credentials::AccessTokenSource, models::FcmPayload};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FcmError {
    #[error("FCM internal request error: {0}")]
    InternalRequest(String),
    #[error("FCM internal response error: {0}")]
    InternalResponse(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("FCM indicated token is not registered or invalid")]
    TokenNotRegistered,
    #[error("FCM quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("FCM unavailable: {0}")]
    Unavailable(String),
    #[error("FCM internal error")]
    InternalError,
    #[error("Unknown FCM error: code={code}, hint={hint:?}")]
    Unknown { code: u16, hint: Option<String> },
}

impl From<reqwest::Error> for FcmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FcmError::InternalResponse(err.to_string())
        } else {
            FcmError::InternalRequest(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    #[serde(default)]
    error_code: Option<String>,
}

impl FcmError {
    /// Classifies a non-success response from the FCM HTTP v1 API.
    pub fn from_response(status: u16, body: &str) -> Self {
        let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
        let message = envelope.error.message;
        let error_code = envelope
            .error
            .details
            .iter()
            .find_map(|d| d.error_code.clone())
            .or(envelope.error.status);

        match error_code.as_deref() {
            Some("UNREGISTERED") => FcmError::TokenNotRegistered,
            Some("INVALID_ARGUMENT") => {
                let lower = message.to_lowercase();
                if lower.contains("registration token") || lower.contains("not registered") {
                    FcmError::TokenNotRegistered
                } else {
                    FcmError::InvalidRequest(message)
                }
            }
            Some("SENDER_ID_MISMATCH")
            | Some("THIRD_PARTY_AUTH_ERROR")
            | Some("UNAUTHENTICATED")
            | Some("PERMISSION_DENIED") => FcmError::Unauthorized(message),
            Some("QUOTA_EXCEEDED") | Some("RESOURCE_EXHAUSTED") => FcmError::QuotaExceeded(message),
            Some("UNAVAILABLE") => FcmError::Unavailable(message),
            Some("INTERNAL") => FcmError::InternalError,
            _ => match status {
                400 => FcmError::InvalidRequest(message),
                401 | 403 => FcmError::Unauthorized(message),
                404 => FcmError::TokenNotRegistered,
                429 => FcmError::QuotaExceeded(message),
                500 => FcmError::InternalError,
                503 => FcmError::Unavailable(message),
                code => FcmError::Unknown {
                    code,
                    hint: error_code.clone().or(Some(message).filter(|m| !m.is_empty())),
                },
            },
        }
    }
}

/// Shortens a device token for log output.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

// Define the trait for sending FCM messages
#[async_trait]
pub trait FcmSend: Send + Sync {
    /// Sends `payload` to one device and returns the gateway's message id.
    async fn send_single(&self, token: &str, payload: FcmPayload) -> Result<String, FcmError>;
}

/// FCM HTTP v1 client.
pub struct HttpFcmClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    send_url: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

impl HttpFcmClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        base_url: &str,
        project_id: &str,
    ) -> Self {
        let send_url = format!(
            "{}/projects/{}/messages:send",
            base_url.trim_end_matches('/'),
            project_id
        );
        Self {
            http,
            tokens,
            send_url,
        }
    }

    /// Builds the `{"message": {...}}` request body.
    pub fn message_body(token: &str, payload: &FcmPayload) -> Result<serde_json::Value, FcmError> {
        let mut message = match serde_json::to_value(payload) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                return Err(FcmError::InvalidRequest(format!(
                    "payload did not serialize to an object: {}",
                    other
                )))
            }
            Err(e) => return Err(FcmError::InvalidRequest(e.to_string())),
        };
        message.retain(|_, v| !v.is_null());
        message.insert("token".to_string(), serde_json::Value::from(token));
        Ok(serde_json::json!({ "message": message }))
    }
}

#[async_trait]
impl FcmSend for HttpFcmClient {
    async fn send_single(&self, token: &str, payload: FcmPayload) -> Result<String, FcmError> {
        let body = Self::message_body(token, &payload)?;
        let access_token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| FcmError::Unauthorized(e.to_string()))?;

        tracing::info!("Sending FCM request for token prefix {}...", token_prefix(token));

        let response = self
            .http
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = FcmError::from_response(status.as_u16(), &text);
            tracing::error!(
                "FCM send failed for token prefix {}: {:?}",
                token_prefix(token),
                error
            );
            return Err(error);
        }

        let sent: SendResponse = response.json().await?;
        tracing::info!(
            "FCM send successful for token prefix {}",
            token_prefix(token)
        );
        Ok(sent.name)
    }
}

// The public FcmClient holds a trait object
pub struct FcmClient {
    client: Box<dyn FcmSend>,
}

impl FcmClient {
    pub fn new(client: HttpFcmClient) -> Self {
        FcmClient {
            client: Box::new(client),
        }
    }

    // Constructor for injecting a mock/custom implementation (for testing)
    pub fn new_with_impl(client_impl: Box<dyn FcmSend>) -> Self {
        FcmClient {
            client: client_impl,
        }
    }

    /// Sends a notification payload to a single FCM token.
    pub async fn send_single(&self, token: &str, payload: FcmPayload) -> Result<String, FcmError> {
        self.client.send_single(token, payload).await
    }
}

// Mock FCM sender, public so integration tests can inject it
#[derive(Clone, Default)]
pub struct MockFcmSender {
    sent_messages: Arc<Mutex<Vec<(String, FcmPayload)>>>,
    attempts: Arc<Mutex<usize>>,
    error_tokens: Arc<Mutex<HashMap<String, FcmError>>>,
}

impl MockFcmSender {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper to retrieve sent messages for assertions
    pub fn get_sent_messages(&self) -> Vec<(String, FcmPayload)> {
        self.sent_messages.lock().unwrap().clone()
    }

    /// Number of send calls, successful or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    // Helper to simulate errors for specific tokens
    pub fn set_error_for_token(&self, token: &str, error: FcmError) {
        self.error_tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), error);
    }
}

#[async_trait]
impl FcmSend for MockFcmSender {
    async fn send_single(&self, token: &str, payload: FcmPayload) -> Result<String, FcmError> {
        *self.attempts.lock().unwrap() += 1;

        if let Some(error) = self.error_tokens.lock().unwrap().get(token) {
            tracing::warn!(
                "MockFcmSender: Simulating error {:?} for token prefix {}",
                error,
                token_prefix(token)
            );
            return Err(error.clone());
        }

        tracing::info!(
            "MockFcmSender: Recording send for token prefix {}...",
            token_prefix(token)
        );
        let mut messages = self.sent_messages.lock().unwrap();
        messages.push((token.to_string(), payload));
        Ok(format!("projects/mock/messages/{}", messages.len()))
    }
}
