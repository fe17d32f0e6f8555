use crate::credentials::CredentialsError;
use crate::document_store::StoreError;
use crate::fcm_sender::FcmError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("FCM error: {0}")]
    Fcm(#[from] FcmError),

    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document path {path} does not match {pattern}")]
    PatternMismatch { path: String, pattern: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::PatternMismatch { .. } | ServiceError::Store(StoreError::Decode(_)) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Store(_) | ServiceError::Fcm(_) | ServiceError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
