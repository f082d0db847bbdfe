use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::model::{Task, WebhookRegistration};
use crate::store::{RegistrationPatch, Store, StoreError, TaskPatch};

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("stored row is not valid JSON: {e}"))
    }
}

/// SQLite-backed store with the same semantics as [`super::MemoryStore`].
///
/// Tasks and registry entries are stored as JSON documents keyed by their
/// primary key; all access goes through a single mutex-guarded connection,
/// so read-modify-write update paths are serialized per key.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    /// Use `":memory:"` for an in-memory database (useful for tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        info!(path = %path, "task database opened and schema verified");
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS webhook_registry (
                source_identifier TEXT PRIMARY KEY,
                entry TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
        let row: Option<String> = conn
            .query_row(
                "SELECT definition FROM tasks WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn load_registration(
        conn: &Connection,
        source_identifier: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        let row: Option<String> = conn
            .query_row(
                "SELECT entry FROM webhook_registry WHERE source_identifier = ?1",
                rusqlite::params![source_identifier],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock();
        Self::load_task(&conn, id)
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        // Check first so a duplicate id surfaces as Conflict, not as an
        // opaque constraint violation.
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tasks WHERE id = ?1",
                rusqlite::params![task.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!("task '{}'", task.id)));
        }

        let definition = serde_json::to_string(task)?;
        conn.execute(
            "INSERT INTO tasks (id, definition) VALUES (?1, ?2)",
            rusqlite::params![task.id, definition],
        )?;
        debug!(task_id = %task.id, "task saved");
        Ok(())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let conn = self.conn.lock();
        let mut task = Self::load_task(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("task '{id}'")))?;
        patch.apply(&mut task);

        let definition = serde_json::to_string(&task)?;
        conn.execute(
            "UPDATE tasks SET definition = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![definition, id],
        )?;
        Ok(task)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("task '{id}'")));
        }
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT definition FROM tasks ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for json in rows {
            tasks.push(serde_json::from_str(&json)?);
        }
        Ok(tasks)
    }

    async fn get_webhook_registration(
        &self,
        source_identifier: &str,
    ) -> Result<Option<WebhookRegistration>, StoreError> {
        let conn = self.conn.lock();
        Self::load_registration(&conn, source_identifier)
    }

    async fn save_webhook_registration(
        &self,
        entry: &WebhookRegistration,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let json = serde_json::to_string(entry)?;
        conn.execute(
            "INSERT INTO webhook_registry (source_identifier, entry) VALUES (?1, ?2) \
             ON CONFLICT(source_identifier) DO UPDATE \
             SET entry = excluded.entry, updated_at = datetime('now')",
            rusqlite::params![entry.source_identifier, json],
        )?;
        debug!(source_identifier = %entry.source_identifier, "webhook registration saved");
        Ok(())
    }

    async fn update_webhook_registration(
        &self,
        source_identifier: &str,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration, StoreError> {
        let conn = self.conn.lock();
        let mut entry = Self::load_registration(&conn, source_identifier)?
            .ok_or_else(|| StoreError::NotFound(format!("registration '{source_identifier}'")))?;
        patch.apply(&mut entry);

        let json = serde_json::to_string(&entry)?;
        conn.execute(
            "UPDATE webhook_registry SET entry = ?1, updated_at = datetime('now') \
             WHERE source_identifier = ?2",
            rusqlite::params![json, source_identifier],
        )?;
        Ok(entry)
    }

    async fn delete_webhook_registration(
        &self,
        source_identifier: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM webhook_registry WHERE source_identifier = ?1",
            rusqlite::params![source_identifier],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!(
                "registration '{source_identifier}'"
            )));
        }
        Ok(())
    }
}
