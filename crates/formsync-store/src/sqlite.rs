//! SQLite-backed store.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::{FieldKey, FieldStore, StoreError, StoredField, from_millis};

// ─────────────────────────────────────────────────────────────────────────────
// Database wrapper (rusqlite is sync, calls run on spawn_blocking)
// ─────────────────────────────────────────────────────────────────────────────

const MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS field_values (
        entity_id   TEXT NOT NULL,
        field_id    TEXT NOT NULL,
        value       TEXT NOT NULL,
        updated_by  TEXT,
        updated_at  INTEGER NOT NULL,
        PRIMARY KEY (entity_id, field_id)
    );
";

const UPSERT: &str = "
    INSERT INTO field_values (entity_id, field_id, value, updated_by, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (entity_id, field_id) DO UPDATE SET
        value = excluded.value,
        updated_by = excluded.updated_by,
        updated_at = excluded.updated_at
";

const DELETE: &str = "DELETE FROM field_values WHERE entity_id = ?1 AND field_id = ?2";

#[derive(Clone)]
pub struct SqliteFieldStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFieldStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        debug!("Opened field store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || f(&conn.lock())).await?;
        Ok(result?)
    }
}

impl FieldStore for SqliteFieldStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute_batch(MIGRATIONS)).await
    }

    async fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> Result<StoredField, StoreError> {
        let stored = StoredField {
            value: value.to_string(),
            updated_by: writer.map(str::to_string),
            updated_at: Utc::now(),
        };
        let key = key.clone();
        let row = stored.clone();
        self.with_conn(move |conn| {
            conn.execute(
                UPSERT,
                params![
                    key.entity_id,
                    key.field_id,
                    row.value,
                    row.updated_by,
                    row.updated_at.timestamp_millis()
                ],
            )
        })
        .await?;
        Ok(stored)
    }

    async fn restore_field_value(
        &self,
        key: &FieldKey,
        prior: Option<&StoredField>,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        let prior = prior.cloned();
        self.with_conn(move |conn| match prior {
            Some(row) => conn.execute(
                UPSERT,
                params![
                    key.entity_id,
                    key.field_id,
                    row.value,
                    row.updated_by,
                    row.updated_at.timestamp_millis()
                ],
            ),
            None => conn.execute(DELETE, params![key.entity_id, key.field_id]),
        })
        .await?;
        Ok(())
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value, updated_by, updated_at FROM field_values WHERE entity_id = ?1 AND field_id = ?2",
                params![key.entity_id, key.field_id],
                |row| {
                    Ok(StoredField {
                        value: row.get(0)?,
                        updated_by: row.get(1)?,
                        updated_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
        })
        .await
    }
}
