use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::store::StoreError;

/// Crate-wide error taxonomy. Every variant maps to an HTTP status so that
/// route handlers can surface manager failures without per-call translation.
#[derive(Debug, Error)]
pub enum HubError {
    /// A source config is missing the key that identifies its external
    /// resource (repoUrl, folderId, url). Raised at execute/registration
    /// time, never at construction.
    #[error("missing source config: {0}")]
    MissingConfig(String),

    /// Malformed webhook payload or an unextractable resource id.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Signature mismatch, channel-token mismatch, or failed credential
    /// verification.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Webhook operations on a plugin type with no derivable source
    /// identifier or no push channel.
    #[error("webhook operations are not supported for plugin type '{0}'")]
    UnsupportedSource(String),

    /// Provider register/deregister failure or a source fetch error that
    /// fails the whole run.
    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::MissingConfig(_)
            | HubError::InvalidPayload(_)
            | HubError::UnsupportedSource(_) => StatusCode::BAD_REQUEST,
            HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HubError::Forbidden(_) => StatusCode::FORBIDDEN,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HubError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            HubError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            HubError::Store(StoreError::Backend(_)) | HubError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
