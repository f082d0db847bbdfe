//! The control plane.
//!
//! [`IngestionManager`] owns the store, the webhook provider, the plugin
//! registry, and the event bus, and is the only writer of machine-owned
//! task state. It resolves triggers into orchestrator runs, keeps the
//! webhook registry consistent with the task set (one external subscription
//! shared by every task on the same source identifier), and threads
//! continuation cursors across runs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cron::CronEvaluator;
use crate::crypto::generate_secret;
use crate::error::HubError;
use crate::events::{EventBus, LifecycleEvent};
use crate::model::{
    CursorUpdate, PluginRef, RunPayload, RunStatus, Task, TaskStatus, Trigger, WebhookRegistration,
};
use crate::pipeline::Orchestrator;
use crate::plugin::{self, PluginRegistry};
use crate::provider::WebhookProvider;
use crate::store::{RegistrationPatch, Store, StoreError, TaskPatch};
use crate::webhook;

/// Result of a webhook dispatch, before HTTP mapping.
#[derive(Debug, Clone)]
pub enum WebhookDispatchOutcome {
    /// The event verified structurally but no registry entry exists for its
    /// resource: valid but uninterested.
    NoSubscription,

    /// Tasks listen on the endpoint, but none of them is registered for this
    /// resource.
    NoTaskMatched,

    /// At least one task ran; `first_status` is the first run's terminal
    /// status.
    Dispatched {
        first_status: RunStatus,
        fanned_out: usize,
    },
}

/// One cron fan-out member that fired.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronFire {
    pub task_id: String,
    pub status: RunStatus,
}

pub struct IngestionManager {
    store: Arc<dyn Store>,
    provider: Arc<dyn WebhookProvider>,
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
    orchestrator: Orchestrator,
    cron: CronEvaluator,
    /// Per-source-identifier dispatch locks: webhook events for one external
    /// resource run in receipt order, distinct resources in parallel.
    dispatch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestionManager {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn WebhookProvider>,
        registry: Arc<PluginRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let orchestrator = Orchestrator::new(registry.clone(), events.clone());
        Self {
            store,
            provider,
            registry,
            events,
            orchestrator,
            cron: CronEvaluator::default(),
            dispatch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the cron tolerance window (seconds).
    pub fn with_cron_window(mut self, window_secs: u64) -> Self {
        self.cron = CronEvaluator::new(window_secs);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    // ── Task CRUD ───────────────────────────────────────────────────────

    /// Persist a new task and, for enabled webhook tasks, run the register
    /// flow. A registration failure leaves the task stored but `Failed`.
    pub async fn schedule_task(&self, mut task: Task) -> Result<Task, HubError> {
        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        task.current_status = TaskStatus::Scheduled;

        self.store.save_task(&task).await?;
        info!(task_id = %task.id, trigger = task.trigger.kind(), "task scheduled");
        self.events.emit(LifecycleEvent::TaskScheduled {
            task_id: task.id.clone(),
        });

        if task.enabled && matches!(task.trigger, Trigger::Webhook(_)) {
            match self.register_webhook(&task).await {
                Ok(updated) => return Ok(updated),
                Err(e) => {
                    self.mark_failed(&task.id).await;
                    return Err(e);
                }
            }
        }
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, HubError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("task '{id}'")))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, HubError> {
        Ok(self.store.list_tasks().await?)
    }

    /// Patch a task, mirroring trigger/source changes to the webhook
    /// registry: deregister when the task stops being a webhook task or its
    /// source identifier changes, register when it becomes one.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, HubError> {
        let existing = self.get_task(id).await?;

        let mut preview = existing.clone();
        patch.clone().apply(&mut preview);

        let was_webhook = matches!(existing.trigger, Trigger::Webhook(_));
        let now_webhook = matches!(preview.trigger, Trigger::Webhook(_));
        let old_identifier =
            plugin::source_identifier(&existing.source.plugin_type, &existing.source.config);
        let new_identifier =
            plugin::source_identifier(&preview.source.plugin_type, &preview.source.config);
        let identity_changed = old_identifier != new_identifier;

        if was_webhook && (!now_webhook || identity_changed) {
            self.deregister_webhook(&existing).await?;
        }

        let updated = self.store.update_task(id, patch).await?;

        let result = if updated.enabled && now_webhook && (!was_webhook || identity_changed) {
            match self.register_webhook(&updated).await {
                Ok(task) => task,
                Err(e) => {
                    self.mark_failed(id).await;
                    return Err(e);
                }
            }
        } else {
            updated
        };

        self.events.emit(LifecycleEvent::TaskUpdated {
            task_id: id.to_string(),
        });
        Ok(result)
    }

    /// Enable a task. Webhook tasks rejoin (or re-create) their shared
    /// subscription. No-op when already enabled.
    pub async fn enable_task(&self, id: &str) -> Result<Task, HubError> {
        let task = self.get_task(id).await?;
        if task.enabled {
            return Ok(task);
        }

        let mut updated = self
            .store
            .update_task(
                id,
                TaskPatch {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if matches!(updated.trigger, Trigger::Webhook(_)) {
            match self.register_webhook(&updated).await {
                Ok(task) => updated = task,
                Err(e) => {
                    self.mark_failed(id).await;
                    return Err(e);
                }
            }
        }

        self.events.emit(LifecycleEvent::TaskUpdated {
            task_id: id.to_string(),
        });
        Ok(updated)
    }

    /// Disable a task. Webhook tasks leave their shared subscription first;
    /// if that makes the subscription empty and external deregistration
    /// fails, the disable is aborted. No-op when already disabled.
    pub async fn disable_task(&self, id: &str) -> Result<Task, HubError> {
        let task = self.get_task(id).await?;
        if !task.enabled {
            return Ok(task);
        }

        if matches!(task.trigger, Trigger::Webhook(_)) {
            self.deregister_webhook(&task).await?;
        }

        let updated = self
            .store
            .update_task(
                id,
                TaskPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.events.emit(LifecycleEvent::TaskUpdated {
            task_id: id.to_string(),
        });
        Ok(updated)
    }

    /// Delete a task. Webhook tasks run the deregister flow first; if that
    /// fails the delete is aborted and the task retained.
    pub async fn delete_task(&self, id: &str) -> Result<(), HubError> {
        let task = self.get_task(id).await?;

        if matches!(task.trigger, Trigger::Webhook(_)) {
            self.deregister_webhook(&task).await?;
        }

        self.store.delete_task(id).await?;
        info!(task_id = %id, "task deleted");
        self.events.emit(LifecycleEvent::TaskDeleted {
            task_id: id.to_string(),
        });
        Ok(())
    }

    // ── Triggers ────────────────────────────────────────────────────────

    /// Run a task on explicit request. Disabled tasks are rejected with 403;
    /// a task already running is rejected with 409.
    pub async fn trigger_manual(
        &self,
        id: &str,
        webhook_payload: Option<Value>,
    ) -> Result<RunStatus, HubError> {
        let task = self.get_task(id).await?;
        if !task.enabled {
            return Err(HubError::Forbidden(format!("task '{id}' is disabled")));
        }
        if task.current_status == TaskStatus::Running {
            return Err(HubError::Conflict(format!("task '{id}' is already running")));
        }

        let mut payload = RunPayload {
            task_definition: Some(task.clone()),
            webhook_payload,
            ..Default::default()
        };
        self.enrich_with_cursors(&task, &mut payload).await;

        self.execute_run(&task, payload, Utc::now()).await
    }

    /// Dispatch an inbound webhook callback. HTTP response codes come from
    /// the returned outcome and the error taxonomy.
    pub async fn trigger_webhook(
        &self,
        endpoint_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookDispatchOutcome, HubError> {
        let endpoint = endpoint_id.trim_start_matches('/');

        let endpoint_tasks: Vec<Task> = self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|task| {
                task.enabled
                    && task
                        .trigger
                        .as_webhook()
                        .is_some_and(|w| w.endpoint_id.trim_start_matches('/') == endpoint)
            })
            .collect();

        if endpoint_tasks.is_empty() {
            return Err(HubError::NotFound(format!(
                "no enabled task for endpoint '{endpoint}'"
            )));
        }

        // Preliminary secretless parse: learn which external resource the
        // event is about before touching the registry.
        let plugin_type = endpoint_tasks[0].source.plugin_type.clone();
        let preliminary = webhook::verify(&plugin_type, headers, body, None)
            .map_err(|e| HubError::InvalidPayload(e.to_string()))?;
        let source_identifier = preliminary.external_resource_id;

        // Events for one resource dispatch in receipt order.
        let lock = self.dispatch_lock(&source_identifier);
        let _guard = lock.lock().await;

        let Some(entry) = self
            .store
            .get_webhook_registration(&source_identifier)
            .await?
        else {
            debug!(
                source_identifier = %source_identifier,
                "webhook event for unsubscribed resource"
            );
            return Ok(WebhookDispatchOutcome::NoSubscription);
        };

        let verified = webhook::verify(&plugin_type, headers, body, Some(&entry.secret))
            .map_err(|_| HubError::Unauthorized("Invalid webhook signature".to_string()))?;
        if !verified.is_valid {
            return Err(HubError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }

        let eligible: Vec<&Task> = endpoint_tasks
            .iter()
            .filter(|task| entry.registered_tasks.contains(&task.id))
            .collect();
        if eligible.is_empty() {
            return Ok(WebhookDispatchOutcome::NoTaskMatched);
        }

        info!(
            source_identifier = %source_identifier,
            change_type = ?verified.change_type,
            fan_out = eligible.len(),
            "dispatching webhook event"
        );

        let mut first_status = None;
        let mut fanned_out = 0;
        for task in eligible {
            if task.current_status == TaskStatus::Running {
                warn!(task_id = %task.id, "skipping webhook fan-out for running task");
                continue;
            }

            let payload = RunPayload {
                task_definition: Some(task.clone()),
                webhook_payload: Some(verified.payload.clone()),
                external_resource_id: Some(source_identifier.clone()),
                change_type: Some(verified.change_type),
                start_page_token: entry.start_page_token.clone(),
                next_page_token: entry.next_page_token.clone(),
                other_crawler_specific_tokens: entry.other_crawler_specific_tokens.clone(),
                fetched_at: None,
            };

            // One failing fan-out member must not stop the rest.
            match self.execute_run(task, payload, Utc::now()).await {
                Ok(status) => {
                    fanned_out += 1;
                    if first_status.is_none() {
                        first_status = Some(status);
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "webhook fan-out member failed");
                }
            }
        }

        match first_status {
            Some(first_status) => Ok(WebhookDispatchOutcome::Dispatched {
                first_status,
                fanned_out,
            }),
            None => Ok(WebhookDispatchOutcome::NoTaskMatched),
        }
    }

    /// Evaluate every enabled cron task against `now` (the external tick's
    /// timestamp, or the wall clock) and run the due ones. A due run records
    /// the consumed scheduled moment as `last_run`, which keeps each slot
    /// idempotent under tick jitter.
    pub async fn trigger_all_due_cron_tasks(
        &self,
        now: Option<DateTime<Utc>>,
    ) -> Result<Vec<CronFire>, HubError> {
        let now = now.unwrap_or_else(Utc::now);

        let mut due = Vec::new();
        for task in self.store.list_tasks().await? {
            let Trigger::Cron { expression } = &task.trigger else {
                continue;
            };
            if !task.enabled {
                continue;
            }

            let previous = match self.cron.previous_scheduled_time(expression, now) {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "skipping task with invalid cron expression");
                    continue;
                }
            };
            let Some(previous) = previous else {
                continue;
            };
            if !task.last_run.is_none_or(|last| last < previous) {
                continue;
            }
            if task.current_status == TaskStatus::Running {
                warn!(task_id = %task.id, "skipping due cron task that is still running");
                continue;
            }

            due.push((task, previous));
        }

        // Due tasks are independent; run them concurrently.
        let runs = due.iter().map(|(task, previous)| async move {
            let mut payload = RunPayload {
                task_definition: Some(task.clone()),
                ..Default::default()
            };
            self.enrich_with_cursors(task, &mut payload).await;

            match self.execute_run(task, payload, *previous).await {
                Ok(status) => Some(CronFire {
                    task_id: task.id.clone(),
                    status,
                }),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cron run failed to start");
                    None
                }
            }
        });

        Ok(futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect())
    }

    // ── Webhook register / deregister flows ─────────────────────────────

    /// Join (or create) the shared subscription for a webhook task, and copy
    /// the subscription's secret and external id into the task trigger.
    async fn register_webhook(&self, task: &Task) -> Result<Task, HubError> {
        let Trigger::Webhook(trigger) = &task.trigger else {
            return Ok(task.clone());
        };
        let source_identifier = self.require_source_identifier(&task.source)?;

        let (secret, external_webhook_id) = match self
            .store
            .get_webhook_registration(&source_identifier)
            .await?
        {
            Some(entry) => {
                // Shared subscription already live: join it, no external call.
                let mut registered = entry.registered_tasks.clone();
                registered.insert(task.id.clone());
                self.store
                    .update_webhook_registration(
                        &source_identifier,
                        RegistrationPatch {
                            registered_tasks: Some(registered),
                            ..Default::default()
                        },
                    )
                    .await?;
                debug!(
                    task_id = %task.id,
                    source_identifier = %source_identifier,
                    "joined existing webhook registration"
                );
                (entry.secret, entry.external_webhook_id)
            }
            None => {
                if !self
                    .provider
                    .verify_credentials(&task.source.plugin_type, &trigger.credentials)
                    .await?
                {
                    return Err(HubError::Unauthorized(format!(
                        "credentials rejected for plugin type '{}'",
                        task.source.plugin_type
                    )));
                }

                let secret = generate_secret();
                let registration = self
                    .provider
                    .register(
                        &task.source.plugin_type,
                        &source_identifier,
                        &trigger.callback_url,
                        &secret,
                        &trigger.credentials,
                    )
                    .await?;

                let entry = WebhookRegistration {
                    source_identifier: source_identifier.clone(),
                    endpoint_id: trigger.endpoint_id.clone(),
                    secret: secret.clone(),
                    external_webhook_id: registration.external_id.clone(),
                    registered_tasks: [task.id.clone()].into(),
                    start_page_token: registration.start_page_token,
                    next_page_token: None,
                    other_crawler_specific_tokens: Default::default(),
                    webhook_flag: true,
                };
                self.store.save_webhook_registration(&entry).await?;
                info!(
                    task_id = %task.id,
                    source_identifier = %source_identifier,
                    external_webhook_id = %registration.external_id,
                    "created webhook registration"
                );
                (secret, registration.external_id)
            }
        };

        let mut updated_trigger = trigger.clone();
        updated_trigger.secret = Some(secret);
        updated_trigger.external_webhook_id = Some(external_webhook_id);

        Ok(self
            .store
            .update_task(
                &task.id,
                TaskPatch {
                    trigger: Some(Trigger::Webhook(updated_trigger)),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Leave the shared subscription. When the task was the last member, the
    /// external subscription is torn down and the entry deleted; a provider
    /// failure restores membership and surfaces the error.
    async fn deregister_webhook(&self, task: &Task) -> Result<(), HubError> {
        let Some(source_identifier) =
            plugin::source_identifier(&task.source.plugin_type, &task.source.config)
        else {
            return Ok(());
        };
        let Some(entry) = self
            .store
            .get_webhook_registration(&source_identifier)
            .await?
        else {
            return Ok(());
        };
        if !entry.registered_tasks.contains(&task.id) {
            return Ok(());
        }

        let mut remaining = entry.registered_tasks.clone();
        remaining.remove(&task.id);
        self.store
            .update_webhook_registration(
                &source_identifier,
                RegistrationPatch {
                    registered_tasks: Some(remaining.clone()),
                    ..Default::default()
                },
            )
            .await?;

        if !remaining.is_empty() {
            debug!(
                task_id = %task.id,
                source_identifier = %source_identifier,
                remaining = remaining.len(),
                "left shared webhook registration"
            );
            return Ok(());
        }

        let credentials = task
            .trigger
            .as_webhook()
            .map(|w| w.credentials.clone())
            .unwrap_or(Value::Null);

        match self
            .provider
            .deregister(
                &task.source.plugin_type,
                &entry.external_webhook_id,
                &source_identifier,
                &credentials,
            )
            .await
        {
            Ok(()) => {
                self.store
                    .delete_webhook_registration(&source_identifier)
                    .await?;
                info!(
                    source_identifier = %source_identifier,
                    "webhook registration removed after last task left"
                );
                Ok(())
            }
            Err(e) => {
                // Restore membership so the entry stays consistent with the
                // still-live external subscription.
                let mut restored = remaining;
                restored.insert(task.id.clone());
                if let Err(restore_err) = self
                    .store
                    .update_webhook_registration(
                        &source_identifier,
                        RegistrationPatch {
                            registered_tasks: Some(restored),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(
                        source_identifier = %source_identifier,
                        error = %restore_err,
                        "failed to restore registration membership"
                    );
                }
                Err(e)
            }
        }
    }

    // ── Run execution ───────────────────────────────────────────────────

    /// Mark the task running, drive the orchestrator, write back cursors,
    /// and persist the terminal status. `last_run_mark` is the wall clock
    /// for manual/webhook runs and the consumed scheduled moment for cron
    /// runs.
    async fn execute_run(
        &self,
        task: &Task,
        payload: RunPayload,
        last_run_mark: DateTime<Utc>,
    ) -> Result<RunStatus, HubError> {
        self.store
            .update_task(
                &task.id,
                TaskPatch {
                    current_status: Some(TaskStatus::Running),
                    ..Default::default()
                },
            )
            .await?;
        self.events.emit(LifecycleEvent::TaskTriggered {
            task_id: task.id.clone(),
            trigger: task.trigger.kind().to_string(),
        });

        let cancel = CancellationToken::new();
        let outcome = self.orchestrator.run(task, payload, &cancel).await;

        self.write_back_cursors(task, &outcome.cursors).await;

        let terminal = if outcome.status.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.store
            .update_task(
                &task.id,
                TaskPatch {
                    current_status: Some(terminal),
                    last_run: Some(last_run_mark),
                    last_run_status: Some(outcome.status.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(outcome.status)
    }

    /// Merge cursors a run produced into the registry entry for the task's
    /// source. Webhook tasks with no entry yet get a minimal one created to
    /// hold the tokens; other tasks without an entry cause no write.
    async fn write_back_cursors(&self, task: &Task, cursors: &CursorUpdate) {
        if cursors.is_empty() {
            return;
        }
        let Some(source_identifier) =
            plugin::source_identifier(&task.source.plugin_type, &task.source.config)
        else {
            return;
        };

        let patch = RegistrationPatch {
            start_page_token: cursors.start_page_token.clone(),
            next_page_token: cursors.next_page_token.clone(),
            other_crawler_specific_tokens: if cursors.other_crawler_specific_tokens.is_empty() {
                None
            } else {
                Some(cursors.other_crawler_specific_tokens.clone())
            },
            ..Default::default()
        };

        match self
            .store
            .update_webhook_registration(&source_identifier, patch)
            .await
        {
            Ok(_) => {
                debug!(source_identifier = %source_identifier, "cursors written back");
            }
            Err(StoreError::NotFound(_)) => {
                let Some(trigger) = task.trigger.as_webhook() else {
                    return;
                };
                let entry = WebhookRegistration {
                    source_identifier: source_identifier.clone(),
                    endpoint_id: trigger.endpoint_id.clone(),
                    secret: trigger.secret.clone().unwrap_or_default(),
                    external_webhook_id: trigger.external_webhook_id.clone().unwrap_or_default(),
                    registered_tasks: [task.id.clone()].into(),
                    start_page_token: cursors.start_page_token.clone(),
                    next_page_token: cursors.next_page_token.clone(),
                    other_crawler_specific_tokens: cursors.other_crawler_specific_tokens.clone(),
                    webhook_flag: false,
                };
                if let Err(e) = self.store.save_webhook_registration(&entry).await {
                    warn!(
                        source_identifier = %source_identifier,
                        error = %e,
                        "failed to create cursor-holding registration entry"
                    );
                }
            }
            Err(e) => {
                warn!(
                    source_identifier = %source_identifier,
                    error = %e,
                    "cursor write-back failed"
                );
            }
        }
    }

    /// Copy any stored cursors for the task's source into the payload, for
    /// manual and cron runs.
    async fn enrich_with_cursors(&self, task: &Task, payload: &mut RunPayload) {
        let Some(source_identifier) =
            plugin::source_identifier(&task.source.plugin_type, &task.source.config)
        else {
            return;
        };
        if let Ok(Some(entry)) = self
            .store
            .get_webhook_registration(&source_identifier)
            .await
        {
            payload.external_resource_id.get_or_insert(source_identifier);
            payload.start_page_token = entry.start_page_token.clone();
            payload.next_page_token = entry.next_page_token.clone();
            payload.other_crawler_specific_tokens = entry.other_crawler_specific_tokens.clone();
        }
    }

    fn require_source_identifier(&self, source: &PluginRef) -> Result<String, HubError> {
        let Some(key) = plugin::identity_key(&source.plugin_type) else {
            return Err(HubError::UnsupportedSource(source.plugin_type.clone()));
        };
        plugin::source_identifier(&source.plugin_type, &source.config).ok_or_else(|| {
            HubError::MissingConfig(format!(
                "'{key}' is required for {}",
                source.plugin_type
            ))
        })
    }

    fn dispatch_lock(&self, source_identifier: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dispatch_locks.lock();
        locks
            .entry(source_identifier.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn mark_failed(&self, id: &str) {
        if let Err(e) = self
            .store
            .update_task(
                id,
                TaskPatch {
                    current_status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(task_id = %id, error = %e, "failed to mark task as failed");
        }
    }
}
