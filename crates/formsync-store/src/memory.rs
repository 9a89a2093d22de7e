//! In-process store. Values live as long as the process.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::{FieldKey, FieldStore, StoreError, StoredField};

#[derive(Debug, Default)]
pub struct MemoryFieldStore {
    values: RwLock<HashMap<FieldKey, StoredField>>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// All values stored for one entity, keyed by field id.
    pub fn entity_values(&self, entity_id: &str) -> HashMap<String, StoredField> {
        self.values
            .read()
            .iter()
            .filter(|(key, _)| key.entity_id == entity_id)
            .map(|(key, field)| (key.field_id.clone(), field.clone()))
            .collect()
    }
}

impl FieldStore for MemoryFieldStore {
    fn backend(&self) -> &'static str {
        "memory"
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
        self.values.write().insert(key.clone(), stored.clone());
        Ok(stored)
    }

    async fn restore_field_value(
        &self,
        key: &FieldKey,
        prior: Option<&StoredField>,
    ) -> Result<(), StoreError> {
        let mut values = self.values.write();
        match prior {
            Some(field) => values.insert(key.clone(), field.clone()),
            None => values.remove(key),
        };
        Ok(())
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        Ok(self.values.read().get(key).cloned())
    }
}
