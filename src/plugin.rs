//! Plugin contracts and the process-wide registry.
//!
//! Concrete crawlers, transformers, and destinations live outside this
//! crate; they plug in through the [`Source`], [`Transformer`], and
//! [`Destination`] contracts. Registration happens once at boot, lookups on
//! every orchestration. Factories build per-run instances bound to the
//! task's `source.config`; the manager never retains an instance across
//! runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::model::{IngestionRecord, RunPayload, SourceResult};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source init failed: {0}")]
    Init(String),

    #[error("source fetch failed: {0}")]
    Fetch(String),
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination init failed: {0}")]
    Init(String),

    #[error("destination delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
#[error("plugin '{plugin_type}' rejected its config: {message}")]
pub struct PluginConfigError {
    pub plugin_type: String,
    pub message: String,
}

/// A crawler. Behaves as a full scan when the payload has no
/// `webhook_payload` and as a delta sync otherwise. Instances own their
/// resources (temp directories, HTTP clients) and must release them on every
/// exit path of `execute`.
#[async_trait]
pub trait Source: Send {
    async fn init(&mut self) -> Result<(), SourceError>;

    async fn execute(&mut self, payload: &RunPayload) -> Result<SourceResult, SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub success: bool,
    pub message: String,
}

/// A delivery target for transformed records.
#[async_trait]
pub trait Destination: Send {
    async fn init(&mut self) -> Result<(), DestinationError>;

    async fn process_data(
        &mut self,
        records: &[IngestionRecord],
    ) -> Result<DeliveryReport, DestinationError>;
}

pub type SourceFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Source>, PluginConfigError> + Send + Sync>;

pub type DestinationFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Destination>, PluginConfigError> + Send + Sync>;

/// Transformers are total: per-item failures come back as records with a
/// non-200 status code, never as panics or errors.
pub type Transformer = Arc<dyn Fn(&[Value], &RunPayload) -> Vec<IngestionRecord> + Send + Sync>;

#[derive(Clone)]
pub struct SourcePlugin {
    pub factory: SourceFactory,
    pub transformer: Transformer,
}

/// In-memory mapping from plugin type to factories. Write-once at boot.
#[derive(Default)]
pub struct PluginRegistry {
    sources: RwLock<HashMap<String, SourcePlugin>>,
    destinations: RwLock<HashMap<String, DestinationFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(
        &self,
        plugin_type: impl Into<String>,
        factory: SourceFactory,
        transformer: Transformer,
    ) {
        self.sources.write().insert(
            plugin_type.into(),
            SourcePlugin {
                factory,
                transformer,
            },
        );
    }

    pub fn register_destination(
        &self,
        plugin_type: impl Into<String>,
        factory: DestinationFactory,
    ) {
        self.destinations.write().insert(plugin_type.into(), factory);
    }

    pub fn lookup_source(&self, plugin_type: &str) -> Option<SourcePlugin> {
        self.sources.read().get(plugin_type).cloned()
    }

    pub fn lookup_destination(&self, plugin_type: &str) -> Option<DestinationFactory> {
        self.destinations.read().get(plugin_type).cloned()
    }
}

// ── Source identity ─────────────────────────────────────────────────────

/// The config key that names a plugin type's external resource, or `None`
/// for plugin types without a derivable identity.
pub fn identity_key(plugin_type: &str) -> Option<&'static str> {
    match plugin_type {
        "git-crawler" => Some("repoUrl"),
        "googledrive-crawler" => Some("folderId"),
        "http-crawler" => Some("url"),
        _ => None,
    }
}

/// Derive the source identifier for a plugin type + config pair.
///
/// This is the only place in the core that inspects plugin-specific config
/// keys.
pub fn source_identifier(plugin_type: &str, config: &Value) -> Option<String> {
    let key = identity_key(plugin_type)?;
    let value = config
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| {
            // http crawlers sometimes name their entry point startUrl
            (plugin_type == "http-crawler")
                .then(|| config.get("startUrl").and_then(Value::as_str))
                .flatten()
        })?;
    (!value.is_empty()).then(|| value.to_string())
}

// ── Stock transformer ───────────────────────────────────────────────────

/// The default transformer handed to `register_source` when a plugin brings
/// no custom one: maps raw source records to [`IngestionRecord`]s leniently,
/// keeping whatever well-known fields are present.
pub fn stock_transformer() -> Transformer {
    Arc::new(|raw, payload| {
        let fetched_at = payload.fetched_at.unwrap_or_else(Utc::now);
        raw.iter()
            .enumerate()
            .map(|(index, record)| {
                let id = record
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("record-{index}"));
                let content = record
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| record.to_string());
                let url = record
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let status_code = record
                    .get("statusCode")
                    .and_then(Value::as_u64)
                    .unwrap_or(200) as u16;
                let metadata = record
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                IngestionRecord {
                    id,
                    content,
                    url,
                    status_code,
                    fetched_at,
                    metadata,
                }
            })
            .collect()
    })
}
