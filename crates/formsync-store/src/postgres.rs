//! PostgreSQL-backed store.

use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::{FieldKey, FieldStore, StoreError, StoredField};

const MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS field_values (
        entity_id   TEXT NOT NULL,
        field_id    TEXT NOT NULL,
        value       TEXT NOT NULL,
        updated_by  TEXT,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (entity_id, field_id)
    );
";

pub struct PostgresFieldStore {
    client: Client,
}

impl PostgresFieldStore {
    /// Connect using a libpq-style connection string.
    ///
    /// The connection driver runs on its own task; if it dies, later calls
    /// fail with [`StoreError::Postgres`].
    pub async fn connect(conn_str: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Field store connection error: {e}");
            }
        });

        info!("Connected to PostgreSQL field store");
        Ok(Self { client })
    }
}

impl FieldStore for PostgresFieldStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.client.batch_execute(MIGRATIONS).await?;
        Ok(())
    }

    async fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> Result<StoredField, StoreError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO field_values (entity_id, field_id, value, updated_by, updated_at)
                 VALUES ($1, $2, $3, $4, now())
                 ON CONFLICT (entity_id, field_id) DO UPDATE SET
                     value = EXCLUDED.value,
                     updated_by = EXCLUDED.updated_by,
                     updated_at = EXCLUDED.updated_at
                 RETURNING updated_at",
                &[&key.entity_id, &key.field_id, &value, &writer],
            )
            .await?;
        let updated_at: DateTime<Utc> = row.try_get(0)?;
        Ok(StoredField {
            value: value.to_string(),
            updated_by: writer.map(str::to_string),
            updated_at,
        })
    }

    async fn restore_field_value(
        &self,
        key: &FieldKey,
        prior: Option<&StoredField>,
    ) -> Result<(), StoreError> {
        match prior {
            Some(row) => {
                self.client
                    .execute(
                        "INSERT INTO field_values (entity_id, field_id, value, updated_by, updated_at)
                         VALUES ($1, $2, $3, $4, $5)
                         ON CONFLICT (entity_id, field_id) DO UPDATE SET
                             value = EXCLUDED.value,
                             updated_by = EXCLUDED.updated_by,
                             updated_at = EXCLUDED.updated_at",
                        &[&key.entity_id, &key.field_id, &row.value, &row.updated_by, &row.updated_at],
                    )
                    .await?;
            }
            None => {
                self.client
                    .execute(
                        "DELETE FROM field_values WHERE entity_id = $1 AND field_id = $2",
                        &[&key.entity_id, &key.field_id],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT value, updated_by, updated_at FROM field_values
                 WHERE entity_id = $1 AND field_id = $2",
                &[&key.entity_id, &key.field_id],
            )
            .await?;
        row.map(|row| -> Result<StoredField, StoreError> {
            Ok(StoredField {
                value: row.try_get(0)?,
                updated_by: row.try_get(1)?,
                updated_at: row.try_get(2)?,
            })
        })
        .transpose()
    }
}
