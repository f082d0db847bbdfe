//! In-process lifecycle event bus.
//!
//! Synchronous fan-out: listeners run on the emitting task's call stack, in
//! registration order. A panicking listener is caught and logged; it never
//! aborts the run that emitted the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

use crate::model::RunStatus;

/// Everything the manager and orchestrator announce about a task's life.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    TaskScheduled { task_id: String },
    TaskUpdated { task_id: String },
    TaskDeleted { task_id: String },
    TaskTriggered { task_id: String, trigger: String },
    DataFetched { task_id: String, record_count: usize },
    DataTransformed { task_id: String, record_count: usize },
    DataProcessed { task_id: String, record_count: usize },
    TaskCompleted { task_id: String, status: RunStatus },
    TaskFailed { task_id: String, status: RunStatus },
}

impl LifecycleEvent {
    pub fn task_id(&self) -> &str {
        match self {
            LifecycleEvent::TaskScheduled { task_id }
            | LifecycleEvent::TaskUpdated { task_id }
            | LifecycleEvent::TaskDeleted { task_id }
            | LifecycleEvent::TaskTriggered { task_id, .. }
            | LifecycleEvent::DataFetched { task_id, .. }
            | LifecycleEvent::DataTransformed { task_id, .. }
            | LifecycleEvent::DataProcessed { task_id, .. }
            | LifecycleEvent::TaskCompleted { task_id, .. }
            | LifecycleEvent::TaskFailed { task_id, .. } => task_id,
        }
    }
}

pub type Listener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners are invoked in registration order.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Deliver `event` to every listener, in order, on the current stack.
    pub fn emit(&self, event: LifecycleEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(task_id = %event.task_id(), "event listener panicked; continuing");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
