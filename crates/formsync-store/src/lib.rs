//! Field value persistence.
//!
//! Each backend implements [`FieldStore`]: an atomic upsert of the latest
//! value of one field of one entity, plus a point read for reloads. There is
//! no history: a write replaces the previous value and its author wholesale.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use memory::MemoryFieldStore;
pub use postgres::PostgresFieldStore;
pub use sqlite::SqliteFieldStore;

/// Identifies one stored value. `entity_id` is a response id, or the form id
/// for values shared by everyone filling the form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldKey {
    pub entity_id: String,
    pub field_id: String,
}

impl FieldKey {
    pub fn new(entity_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            field_id: field_id.into(),
        }
    }
}

/// The current value of a field and who wrote it last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredField {
    pub value: String,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable "latest value per field" storage.
///
/// `upsert_field_value` must be atomic per [`FieldKey`]: concurrent writes to
/// the same key leave exactly one of them in place, never a mix.
pub trait FieldStore: Send + Sync + 'static {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Prepare the backend (migrations, connectivity). Called once at startup.
    fn init(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send {
        async { Ok(()) }
    }

    /// Insert or overwrite the value stored under `key`.
    fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> impl std::future::Future<Output = Result<StoredField, StoreError>> + Send;

    /// Put `key` back to an earlier state: the given row verbatim, or no row
    /// at all. Used to undo a write whose caller already gave up on it.
    fn restore_field_value(
        &self,
        key: &FieldKey,
        prior: Option<&StoredField>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read the value stored under `key`, if any write has happened.
    fn field_value(
        &self,
        key: &FieldKey,
    ) -> impl std::future::Future<Output = Result<Option<StoredField>, StoreError>> + Send;
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
