use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A reference to a registered plugin plus its per-task configuration.
///
/// `config` is an open map whose keys are only meaningful to the plugin
/// itself (and to `plugin::source_identifier`, which knows the identifying
/// key for each built-in plugin type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRef {
    pub plugin_type: String,
    #[serde(default)]
    pub config: Value,
}

/// The condition under which a task fires.
///
/// Dispatch always switches on the tag, never on the presence of optional
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Cron { expression: String },
    Webhook(WebhookTrigger),
}

impl Trigger {
    /// The tag name, for logging and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Cron { .. } => "cron",
            Trigger::Webhook(_) => "webhook",
        }
    }

    pub fn as_webhook(&self) -> Option<&WebhookTrigger> {
        match self {
            Trigger::Webhook(w) => Some(w),
            _ => None,
        }
    }
}

/// Webhook trigger configuration.
///
/// `external_webhook_id` and `secret` are machine-owned: the register flow
/// copies them in from the shared registry entry (or from a fresh provider
/// registration) so that every task fanned out from one subscription carries
/// the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTrigger {
    /// Local HTTP path segment that receives callbacks (e.g. `"gh"`).
    pub endpoint_id: String,

    /// Publicly reachable URL handed to the provider at registration.
    #[serde(default)]
    pub callback_url: String,

    /// Provider credentials, opaque to the core (open map).
    #[serde(default)]
    pub credentials: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_webhook_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Machine-owned task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// One ingestion job: what to crawl, where to deliver, and when to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id; assigned on creation when the caller leaves it empty.
    #[serde(default)]
    pub id: String,

    pub name: String,

    /// Disabled tasks never trigger; webhook fan-out skips them.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub source: PluginRef,

    /// Absent destination means results are emitted as events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PluginRef>,

    pub trigger: Trigger,

    #[serde(default)]
    pub current_status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
}

fn default_enabled() -> bool {
    true
}

/// Shared subscription record for a single external resource (a repo, a
/// Drive folder). Multiple tasks may fan out from one registration; the
/// `registered_tasks` set is the authoritative fan-out list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    /// Primary key, derived from the task's plugin type and config.
    pub source_identifier: String,

    /// Local endpoint the external service calls back on.
    pub endpoint_id: String,

    /// 20 random bytes, hex-encoded. Generated once per entry, never rotated
    /// implicitly. Used as the HMAC key (git) or the channel token (drive).
    pub secret: String,

    /// Provider-issued id, needed to deregister.
    #[serde(default)]
    pub external_webhook_id: String,

    #[serde(default)]
    pub registered_tasks: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,

    /// Escape hatch for cursors of future source types.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub other_crawler_specific_tokens: Map<String, Value>,

    /// True while the subscription is live externally.
    #[serde(default)]
    pub webhook_flag: bool,
}

/// Classified intent of a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Upsert,
    Delete,
    Unknown,
}

/// The transformer/destination interchange record.
///
/// A `status_code` other than 200 marks a per-item fetch failure; `content`
/// then holds the error description instead of source data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// What a source hands back from one `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceData {
    /// The raw records. Well-behaved sources return a list here; a scalar is
    /// tolerated and wrapped by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub other_crawler_specific_tokens: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    pub success: bool,
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SourceData>,
}

impl SourceResult {
    pub fn ok(data: SourceData) -> Self {
        Self {
            success: true,
            code: 200,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// The uniform payload handed to a source's `execute` and to transformers.
///
/// A source behaves as a full scan when `webhook_payload` is absent and as a
/// delta sync otherwise. `fetched_at` is stamped by the orchestrator right
/// before the transform stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_resource_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub other_crawler_specific_tokens: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Terminal status of one orchestrator run, kept on the task for
/// observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub success: bool,
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub items_processed: usize,
}

impl RunStatus {
    pub fn completed(items_processed: usize) -> Self {
        Self {
            success: true,
            code: 200,
            message: "completed".to_string(),
            items_processed,
        }
    }

    pub fn failed(code: u16, message: impl Into<String>, items_processed: usize) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            items_processed,
        }
    }
}

/// Continuation cursors a source produced during a run, to be merged back
/// into the webhook registry entry. Fields the source did not return stay
/// `None` and never erase previously stored values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorUpdate {
    pub start_page_token: Option<String>,
    pub next_page_token: Option<String>,
    pub other_crawler_specific_tokens: Map<String, Value>,
}

impl CursorUpdate {
    pub fn is_empty(&self) -> bool {
        self.start_page_token.is_none()
            && self.next_page_token.is_none()
            && self.other_crawler_specific_tokens.is_empty()
    }
}
