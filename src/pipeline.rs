//! The per-run pipeline: source → transform → destination.
//!
//! One [`Orchestrator::run`] call is one task invocation. Every stage error
//! is converted into a failed [`RunStatus`] plus a `TaskFailed` event;
//! nothing escapes as `Err`, so callers always get a terminal status to
//! persist. Cancelling the token aborts the source call and short-circuits
//! the remaining stages.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, LifecycleEvent};
use crate::model::{CursorUpdate, RunPayload, RunStatus, SourceData, Task};
use crate::plugin::PluginRegistry;

/// Terminal status of a run plus whatever cursors the source produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub cursors: CursorUpdate,
}

pub struct Orchestrator {
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(registry: Arc<PluginRegistry>, events: Arc<EventBus>) -> Self {
        Self { registry, events }
    }

    /// Execute one run for `task`.
    pub async fn run(
        &self,
        task: &Task,
        mut payload: RunPayload,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let plugin_type = task.source.plugin_type.as_str();

        let Some(plugin) = self.registry.lookup_source(plugin_type) else {
            return self.fail(task, 400, format!("unknown source plugin '{plugin_type}'"), 0);
        };

        let mut source = match (plugin.factory)(&task.source.config) {
            Ok(source) => source,
            Err(e) => return self.fail(task, 400, e.to_string(), 0),
        };

        if let Err(e) = source.init().await {
            return self.fail(task, 500, e.to_string(), 0);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return self.fail(task, 499, "run cancelled", 0);
            }
            result = source.execute(&payload) => result,
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => return self.fail(task, 502, e.to_string(), 0),
        };
        if !result.success {
            let code = if result.code >= 400 { result.code } else { 502 };
            return self.fail(task, code, result.message, 0);
        }

        let cursors = extract_cursors(result.data.as_ref());
        let raw = flatten(result.data.as_ref(), &task.id);
        self.events.emit(LifecycleEvent::DataFetched {
            task_id: task.id.clone(),
            record_count: raw.len(),
        });

        if cancel.is_cancelled() {
            return self.fail_with_cursors(task, 499, "run cancelled", 0, cursors);
        }

        payload.fetched_at = Some(Utc::now());
        let records = (plugin.transformer)(&raw, &payload);
        self.events.emit(LifecycleEvent::DataTransformed {
            task_id: task.id.clone(),
            record_count: records.len(),
        });

        if let Some(destination_ref) = &task.destination {
            let destination_type = destination_ref.plugin_type.as_str();
            let Some(factory) = self.registry.lookup_destination(destination_type) else {
                return self.fail_with_cursors(
                    task,
                    400,
                    format!("unknown destination plugin '{destination_type}'"),
                    0,
                    cursors,
                );
            };

            let mut destination = match factory(&destination_ref.config) {
                Ok(destination) => destination,
                Err(e) => return self.fail_with_cursors(task, 400, e.to_string(), 0, cursors),
            };
            if let Err(e) = destination.init().await {
                return self.fail_with_cursors(task, 500, e.to_string(), 0, cursors);
            }

            if cancel.is_cancelled() {
                return self.fail_with_cursors(task, 499, "run cancelled", 0, cursors);
            }

            match destination.process_data(&records).await {
                Ok(report) if report.success => {}
                Ok(report) => {
                    return self.fail_with_cursors(task, 502, report.message, 0, cursors);
                }
                Err(e) => {
                    return self.fail_with_cursors(task, 502, e.to_string(), 0, cursors);
                }
            }

            self.events.emit(LifecycleEvent::DataProcessed {
                task_id: task.id.clone(),
                record_count: records.len(),
            });
        } else {
            debug!(task_id = %task.id, "no destination configured; records surfaced via events only");
        }

        let status = RunStatus::completed(records.len());
        self.events.emit(LifecycleEvent::TaskCompleted {
            task_id: task.id.clone(),
            status: status.clone(),
        });
        RunOutcome { status, cursors }
    }

    fn fail(
        &self,
        task: &Task,
        code: u16,
        message: impl Into<String>,
        items_processed: usize,
    ) -> RunOutcome {
        self.fail_with_cursors(task, code, message, items_processed, CursorUpdate::default())
    }

    fn fail_with_cursors(
        &self,
        task: &Task,
        code: u16,
        message: impl Into<String>,
        items_processed: usize,
        cursors: CursorUpdate,
    ) -> RunOutcome {
        let status = RunStatus::failed(code, message, items_processed);
        warn!(
            task_id = %task.id,
            code = status.code,
            message = %status.message,
            "task run failed"
        );
        self.events.emit(LifecycleEvent::TaskFailed {
            task_id: task.id.clone(),
            status: status.clone(),
        });
        RunOutcome { status, cursors }
    }
}

/// Flatten a source result into raw records.
///
/// The lenient rule: `data.data` list is used directly, a scalar is wrapped
/// into a singleton, and absent data yields the empty list with a warning.
fn flatten(data: Option<&SourceData>, task_id: &str) -> Vec<Value> {
    match data {
        None => {
            warn!(task_id = %task_id, "source returned no data payload");
            Vec::new()
        }
        Some(source_data) => match &source_data.data {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => {
                warn!(task_id = %task_id, "source data carries no records");
                Vec::new()
            }
            Some(scalar) => vec![scalar.clone()],
        },
    }
}

fn extract_cursors(data: Option<&SourceData>) -> CursorUpdate {
    match data {
        None => CursorUpdate::default(),
        Some(source_data) => CursorUpdate {
            start_page_token: source_data.start_page_token.clone(),
            next_page_token: source_data.next_page_token.clone(),
            other_crawler_specific_tokens: source_data.other_crawler_specific_tokens.clone(),
        },
    }
}
