use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SchemaError;
use crate::schema::{
    FieldDefinition, STATIC_SCHEMA_ID, SchemaSpec, build_static_schema, validate_field_defs,
};
use crate::store::SchemaStore;

/// Owns the built-in schema and every dynamic schema keyed by owner.
///
/// The registry is the only shared mutable state in the pipeline. Writes for
/// one owner, and cache fills after a miss, are serialized by that owner's
/// lock, so the cache never holds a schema the store no longer has.
pub struct SchemaRegistry {
    static_schema: Arc<SchemaSpec>,
    cache: DashMap<String, Arc<SchemaSpec>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    store: Arc<dyn SchemaStore>,
}

fn validate_owner(owner_key: &str) -> Result<(), SchemaError> {
    let valid = !owner_key.is_empty()
        && owner_key.len() <= 128
        && owner_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && !owner_key.starts_with('.')
        && owner_key != STATIC_SCHEMA_ID;
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidOwner(owner_key.to_string()))
    }
}

impl SchemaRegistry {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self {
            static_schema: Arc::new(build_static_schema()),
            cache: DashMap::new(),
            locks: DashMap::new(),
            store,
        }
    }

    pub fn static_schema(&self) -> Arc<SchemaSpec> {
        Arc::clone(&self.static_schema)
    }

    fn owner_lock(&self, owner_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(owner_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Validate `field_defs`, persist the result under `owner_key`, and return it.
    /// Re-registering an owner replaces its schema with a bumped version.
    pub async fn build_dynamic_schema(
        &self,
        owner_key: &str,
        field_defs: Vec<FieldDefinition>,
    ) -> Result<Arc<SchemaSpec>, SchemaError> {
        validate_owner(owner_key)?;
        let fields = validate_field_defs(field_defs)?;

        let lock = self.owner_lock(owner_key);
        let _guard = lock.lock().await;

        let previous = self.load_locked(owner_key).await?;
        let spec = SchemaSpec {
            id: owner_key.to_string(),
            version: previous.map(|p| p.version + 1).unwrap_or(1),
            fields,
        };

        self.store
            .put_schema(owner_key, &spec)
            .await
            .map_err(|e| SchemaError::Persistence(e.to_string()))?;

        let spec = Arc::new(spec);
        self.cache.insert(owner_key.to_string(), Arc::clone(&spec));
        info!(owner = owner_key, version = spec.version, fields = spec.len(), "Registered dynamic schema");
        Ok(spec)
    }

    pub async fn get(&self, owner_key: &str) -> Result<Arc<SchemaSpec>, SchemaError> {
        validate_owner(owner_key)?;
        if let Some(spec) = self.cache.get(owner_key) {
            return Ok(spec.value().clone());
        }

        let lock = self.owner_lock(owner_key);
        let _guard = lock.lock().await;
        self.load_locked(owner_key)
            .await?
            .ok_or_else(|| SchemaError::NotFound(owner_key.to_string()))
    }

    pub async fn delete(&self, owner_key: &str) -> Result<bool, SchemaError> {
        validate_owner(owner_key)?;
        let lock = self.owner_lock(owner_key);
        let _guard = lock.lock().await;

        let removed = self
            .store
            .delete_schema(owner_key)
            .await
            .map_err(|e| SchemaError::Persistence(e.to_string()))?;
        self.cache.remove(owner_key);
        debug!(owner = owner_key, removed, "Deleted dynamic schema");
        Ok(removed)
    }

    /// Cache, then store. Callers hold the owner lock.
    async fn load_locked(&self, owner_key: &str) -> Result<Option<Arc<SchemaSpec>>, SchemaError> {
        if let Some(spec) = self.cache.get(owner_key) {
            return Ok(Some(spec.value().clone()));
        }

        let stored = self
            .store
            .get_schema(owner_key)
            .await
            .map_err(|e| SchemaError::Persistence(e.to_string()))?;

        Ok(stored.map(|spec| {
            let spec = Arc::new(spec);
            self.cache.insert(owner_key.to_string(), Arc::clone(&spec));
            spec
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySchemaStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(Arc::new(InMemorySchemaStore::new()))
    }

    #[tokio::test]
    async fn test_rejects_non_snake_case_field() {
        let reg = registry();
        let err = reg
            .build_dynamic_schema("alice", vec![FieldDefinition::Name("Switching Type".into())])
            .await
            .unwrap_err();
        assert_eq!(err, SchemaError::InvalidFieldName { field: "Switching Type".into() });
        assert!(err.to_string().contains("Switching Type"));
        assert_eq!(reg.get("alice").await.unwrap_err(), SchemaError::NotFound("alice".into()));
    }

    #[tokio::test]
    async fn test_register_then_get_and_version_bump() {
        let reg = registry();
        let v1 = reg
            .build_dynamic_schema("alice", vec![FieldDefinition::Name("on_off_ratio".into())])
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let v2 = reg
            .build_dynamic_schema("alice", vec![FieldDefinition::Name("device_area".into())])
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(reg.get("alice").await.unwrap().fields[0].name, "device_area");
        // The earlier spec handed out is untouched
        assert_eq!(v1.fields[0].name, "on_off_ratio");
    }

    #[tokio::test]
    async fn test_reads_through_to_store() {
        let store = Arc::new(InMemorySchemaStore::new());
        let first = SchemaRegistry::new(store.clone());
        first
            .build_dynamic_schema("bob", vec![FieldDefinition::Name("doi".into())])
            .await
            .unwrap();

        let second = SchemaRegistry::new(store);
        assert_eq!(second.get("bob").await.unwrap().fields.len(), 1);
        assert!(second.delete("bob").await.unwrap());
        assert!(second.get("bob").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_owner_key() {
        let reg = registry();
        assert!(matches!(reg.get("../etc").await, Err(SchemaError::InvalidOwner(_))));
    }

    #[tokio::test]
    async fn test_static_id_is_reserved() {
        let reg = registry();
        let err = reg
            .build_dynamic_schema(STATIC_SCHEMA_ID, vec![FieldDefinition::Name("doi".into())])
            .await
            .unwrap_err();
        assert_eq!(err, SchemaError::InvalidOwner(STATIC_SCHEMA_ID.into()));
        assert!(reg.static_schema().is_static());
    }

    /// Delays every read so a lookup can straddle a delete.
    struct SlowReads(InMemorySchemaStore);

    #[async_trait]
    impl SchemaStore for SlowReads {
        async fn get_schema(&self, owner_key: &str) -> anyhow::Result<Option<SchemaSpec>> {
            let spec = self.0.get_schema(owner_key).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(spec)
        }

        async fn put_schema(&self, owner_key: &str, spec: &SchemaSpec) -> anyhow::Result<()> {
            self.0.put_schema(owner_key, spec).await
        }

        async fn delete_schema(&self, owner_key: &str) -> anyhow::Result<bool> {
            self.0.delete_schema(owner_key).await
        }
    }

    #[tokio::test]
    async fn test_delete_during_read_does_not_refill_cache() {
        let store = Arc::new(SlowReads(InMemorySchemaStore::new()));
        SchemaRegistry::new(store.clone())
            .build_dynamic_schema("dave", vec![FieldDefinition::Name("doi".into())])
            .await
            .unwrap();

        // Fresh registry so the first read misses the cache
        let reg = Arc::new(SchemaRegistry::new(store));
        let reader = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.get("dave").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(reg.delete("dave").await.unwrap());
        assert_eq!(reader.await.unwrap().unwrap().version, 1);
        assert_eq!(reg.get("dave").await.unwrap_err(), SchemaError::NotFound("dave".into()));
    }

    #[tokio::test]
    async fn test_concurrent_writes_leave_consistent_version() {
        let reg = Arc::new(registry());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.build_dynamic_schema("carol", vec![FieldDefinition::Name(format!("field_{}", i))])
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(reg.get("carol").await.unwrap().version, 8);
    }
}
