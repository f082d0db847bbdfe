//! Persistence for tasks and webhook-registry entries.
//!
//! [`MemoryStore`] is the reference implementation; [`SqliteStore`] provides
//! the same semantics on disk. Both serialize writes per key, which is what
//! the manager's read-modify-write sequences on `registered_tasks` and the
//! cursor fields rely on.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{
    PluginRef, RunStatus, Task, TaskStatus, Trigger, WebhookRegistration,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}' already exists")]
    Conflict(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Partial update of a [`Task`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub source: Option<PluginRef>,
    pub destination: Option<PluginRef>,
    pub trigger: Option<Trigger>,
    pub current_status: Option<TaskStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
}

impl TaskPatch {
    /// Apply this patch to a stored task.
    pub fn apply(self, task: &mut Task) {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }
        if let Some(source) = self.source {
            task.source = source;
        }
        if let Some(destination) = self.destination {
            task.destination = Some(destination);
        }
        if let Some(trigger) = self.trigger {
            task.trigger = trigger;
        }
        if let Some(status) = self.current_status {
            task.current_status = status;
        }
        if let Some(last_run) = self.last_run {
            task.last_run = Some(last_run);
        }
        if let Some(last_run_status) = self.last_run_status {
            task.last_run_status = Some(last_run_status);
        }
    }
}

/// Partial update of a [`WebhookRegistration`]. `None` fields are left
/// untouched; `other_crawler_specific_tokens` is merged key-by-key so a run
/// that reports one cursor never erases another.
#[derive(Debug, Clone, Default)]
pub struct RegistrationPatch {
    pub endpoint_id: Option<String>,
    pub secret: Option<String>,
    pub external_webhook_id: Option<String>,
    pub registered_tasks: Option<BTreeSet<String>>,
    pub start_page_token: Option<String>,
    pub next_page_token: Option<String>,
    pub other_crawler_specific_tokens: Option<Map<String, Value>>,
    pub webhook_flag: Option<bool>,
}

impl RegistrationPatch {
    /// Apply this patch to a stored registration entry.
    pub fn apply(self, entry: &mut WebhookRegistration) {
        if let Some(endpoint_id) = self.endpoint_id {
            entry.endpoint_id = endpoint_id;
        }
        if let Some(secret) = self.secret {
            entry.secret = secret;
        }
        if let Some(external_webhook_id) = self.external_webhook_id {
            entry.external_webhook_id = external_webhook_id;
        }
        if let Some(registered_tasks) = self.registered_tasks {
            entry.registered_tasks = registered_tasks;
        }
        if let Some(start_page_token) = self.start_page_token {
            entry.start_page_token = Some(start_page_token);
        }
        if let Some(next_page_token) = self.next_page_token {
            entry.next_page_token = Some(next_page_token);
        }
        if let Some(tokens) = self.other_crawler_specific_tokens {
            entry.other_crawler_specific_tokens.extend(tokens);
        }
        if let Some(webhook_flag) = self.webhook_flag {
            entry.webhook_flag = webhook_flag;
        }
    }
}

/// Persistence contract consumed by the manager.
///
/// All operations must be safe under concurrent callers. Implementations
/// must serialize writes per key: the manager merges `registered_tasks`
/// transactionally via get-then-update, and last-writer-wins on the whole
/// entry would lose fan-out members.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Persist a new task. Fails with [`StoreError::Conflict`] when the id
    /// is already taken.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Patch an existing task, returning the updated value.
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError>;

    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn get_webhook_registration(
        &self,
        source_identifier: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError>;

    /// Insert or replace a registration entry (keyed by source identifier).
    async fn save_webhook_registration(
        &self,
        entry: &WebhookRegistration,
    ) -> Result<(), StoreError>;

    /// Patch an existing entry, returning the updated value.
    async fn update_webhook_registration(
        &self,
        source_identifier: &str,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration, StoreError>;

    async fn delete_webhook_registration(&self, source_identifier: &str)
    -> Result<(), StoreError>;
}
