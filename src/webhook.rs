//! Pure webhook verification: no I/O, no store access.
//!
//! Given the service flavor (derived from the task's plugin type), the raw
//! request headers/body, and optionally the expected secret, [`verify`]
//! authenticates the callback and extracts the external resource id and the
//! classified change type. The manager calls it twice per dispatch: once
//! without a secret to learn which resource the event is about, and once
//! with the registry entry's secret to authenticate it.

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::crypto::{compute_hmac_sha256, constant_time_eq};
use crate::model::ChangeType;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("unsupported signature algorithm (expected sha256=)")]
    UnsupportedAlgorithm,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("channel token mismatch")]
    TokenMismatch,

    #[error("could not extract external resource id: {0}")]
    MissingResourceId(String),

    #[error("webhook verification is not supported for plugin type '{0}'")]
    UnsupportedService(String),
}

/// Outcome of a successful verification pass.
///
/// `is_valid` is false when a secret was expected but the request carried no
/// signature header at all; field extraction still happens so the caller can
/// log what the event was about.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    pub is_valid: bool,
    pub payload: Value,
    pub external_resource_id: String,
    pub change_type: ChangeType,
}

/// Verify an inbound webhook request for the given plugin type.
pub fn verify(
    plugin_type: &str,
    headers: &HeaderMap,
    body: &[u8],
    expected_secret: Option<&str>,
) -> Result<VerifiedEvent, VerifyError> {
    match plugin_type {
        "git-crawler" => verify_git(headers, body, expected_secret),
        "googledrive-crawler" => verify_drive(headers, expected_secret),
        other => Err(VerifyError::UnsupportedService(other.to_string())),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ── Git style: HMAC-SHA256 over the raw body ────────────────────────────

fn verify_git(
    headers: &HeaderMap,
    body: &[u8],
    expected_secret: Option<&str>,
) -> Result<VerifiedEvent, VerifyError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| VerifyError::InvalidJson(e.to_string()))?;

    let mut is_valid = true;
    if let Some(secret) = expected_secret {
        match header_str(headers, "x-hub-signature-256")
            .or_else(|| header_str(headers, "x-hub-signature"))
        {
            None => {
                // Absent signature is not an error at this layer; the caller
                // decides whether an unauthenticated event is acceptable.
                warn!("webhook request carries no signature header");
                is_valid = false;
            }
            Some(signature) => {
                if !signature.starts_with("sha256=") {
                    return Err(VerifyError::UnsupportedAlgorithm);
                }
                let expected = compute_hmac_sha256(secret, body);
                if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
                    return Err(VerifyError::InvalidSignature);
                }
            }
        }
    }

    let event = header_str(headers, "x-github-event").unwrap_or("");
    let change_type = match event {
        "push" => {
            if payload
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                ChangeType::Delete
            } else {
                ChangeType::Upsert
            }
        }
        "pull_request" => ChangeType::Upsert,
        _ => ChangeType::Unknown,
    };

    let full_name = payload
        .pointer("/repository/full_name")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::MissingResourceId("repository.full_name".to_string()))?;

    Ok(VerifiedEvent {
        is_valid,
        external_resource_id: format!("https://github.com/{full_name}"),
        change_type,
        payload,
    })
}

// ── Drive style: channel token + header URI ─────────────────────────────

fn verify_drive(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<VerifiedEvent, VerifyError> {
    if let Some(secret) = expected_secret {
        let channel_id = header_str(headers, "x-goog-channel-id").unwrap_or("");
        if !constant_time_eq(channel_id.as_bytes(), secret.as_bytes()) {
            return Err(VerifyError::TokenMismatch);
        }
    }

    let resource_uri = header_str(headers, "x-goog-resource-uri")
        .ok_or_else(|| VerifyError::MissingResourceId("X-Goog-Resource-Uri".to_string()))?;
    let folder_id = last_path_segment(resource_uri)
        .ok_or_else(|| VerifyError::MissingResourceId("X-Goog-Resource-Uri".to_string()))?;

    let change_type = match header_str(headers, "x-goog-resource-state").unwrap_or("") {
        "exists" | "add" | "update" => ChangeType::Upsert,
        "not_exists" | "trash" => ChangeType::Delete,
        _ => ChangeType::Unknown,
    };

    // Drive notification bodies are empty; synthesize the payload from the
    // X-Goog-* headers so downstream stages see a uniform shape.
    let mut payload = Map::new();
    for (name, value) in headers.iter() {
        if name.as_str().starts_with("x-goog-")
            && let Ok(text) = value.to_str()
        {
            payload.insert(name.as_str().to_string(), Value::String(text.to_string()));
        }
    }

    Ok(VerifiedEvent {
        is_valid: true,
        payload: Value::Object(payload),
        external_resource_id: folder_id,
        change_type,
    })
}

/// Last non-empty path segment of a URI, query string ignored.
fn last_path_segment(uri: &str) -> Option<String> {
    let path = uri.split('?').next().unwrap_or(uri);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}
