use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::model::{Task, WebhookRegistration};
use crate::store::{RegistrationPatch, Store, StoreError, TaskPatch};

/// The reference in-memory store.
///
/// Each table sits behind its own `RwLock`; taking the write lock for every
/// mutation serializes writes per key, which is all the manager's
/// get-then-update sequences require in a single process.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    registrations: RwLock<HashMap<String, WebhookRegistration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task '{}'", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, "task saved");
        Ok(())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("task '{id}'")))?;
        patch.apply(task);
        Ok(task.clone())
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("task '{id}'")))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn get_webhook_registration(
        &self,
        source_identifier: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        Ok(self.registrations.read().get(source_identifier).cloned())
    }

    async fn save_webhook_registration(
        &self,
        entry: &WebhookRegistration,
    ) -> Result<(), StoreError> {
        self.registrations
            .write()
            .insert(entry.source_identifier.clone(), entry.clone());
        debug!(source_identifier = %entry.source_identifier, "webhook registration saved");
        Ok(())
    }

    async fn update_webhook_registration(
        &self,
        source_identifier: &str,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration, StoreError> {
        let mut registrations = self.registrations.write();
        let entry = registrations
            .get_mut(source_identifier)
            .ok_or_else(|| StoreError::NotFound(format!("registration '{source_identifier}'")))?;
        patch.apply(entry);
        Ok(entry.clone())
    }

    async fn delete_webhook_registration(
        &self,
        source_identifier: &str,
    ) -> Result<(), StoreError> {
        let mut registrations = self.registrations.write();
        registrations
            .remove(source_identifier)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("registration '{source_identifier}'")))
    }
}
