//! Tenant-scoped model registry.
//!
//! Schemas are registered once at startup. A [`CompiledModel`] binds a schema
//! to a tenant and names the storage collection holding that tenant's records.
//! Compiled models are cached for the life of the registry and shared as
//! [`Arc`]s, so every caller asking for the same (schema, tenant) pair sees the
//! same handle.
//!
//! # Thread Safety
//!
//! [`ModelRegistry`] is `Send + Sync`. The compile-if-absent step runs under a
//! single mutex, so concurrent first requests for the same pair converge on
//! one handle. The lock is never held while records are fetched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::DataType;
use crate::types::{SchemaName, TenantId, ValidationError};
use crate::value::RawRecord;

/// Registry errors. All indicate a caller or configuration bug.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No schema with this name was registered.
    #[error("schema not registered: {name}")]
    SchemaNotRegistered { name: String },

    /// The tenant identifier is empty or malformed.
    #[error("invalid tenant {tenant:?}: {source}")]
    InvalidTenant {
        tenant: String,
        #[source]
        source: ValidationError,
    },

    /// The schema name is empty or malformed.
    #[error("invalid schema name {name:?}: {source}")]
    InvalidSchemaName {
        name: String,
        #[source]
        source: ValidationError,
    },

    /// The schema name differs only by case from one already registered.
    #[error("schema name {name:?} collides with registered schema {existing:?}")]
    SchemaNameConflict { name: String, existing: String },
}

/// A field declared by a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
}

/// A registered record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// A schema bound to a tenant.
#[derive(Debug, PartialEq, Eq)]
pub struct CompiledModel {
    pub schema: SchemaName,
    pub tenant: TenantId,
    /// Storage collection holding this tenant's records of this schema.
    pub collection: String,
    /// Definition as registered when the model was compiled.
    pub definition: SchemaDefinition,
}

/// Derives the collection identifier for a (schema, tenant) pair.
///
/// Tenant IDs cannot contain `_`, so the identifier is unique per pair.
pub fn collection_name(schema: &SchemaName, tenant: &TenantId) -> String {
    format!("tenant_{}_{}s", tenant, schema.as_str().to_lowercase())
}

/// Paging for [`RecordSource::fetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A backing store that returns raw records for a compiled model.
pub trait RecordSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(&self, model: &CompiledModel, query: &RecordQuery) -> Result<Vec<RawRecord>, Self::Error>;
}

type ModelKey = (SchemaName, TenantId);

/// Registry of schema definitions and compiled tenant models.
///
/// Owned by the application root and passed by reference.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    schemas: RwLock<BTreeMap<SchemaName, SchemaDefinition>>,
    models: Mutex<HashMap<ModelKey, Arc<CompiledModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a schema definition.
    ///
    /// Models compiled earlier keep the definition they were compiled with.
    /// Names that differ only by case share a collection name, so registering
    /// `BAR` after `Bar` fails.
    pub fn register_schema(&self, name: &str, definition: SchemaDefinition) -> Result<(), RegistryError> {
        let schema = SchemaName::new(name).map_err(|source| RegistryError::InvalidSchemaName {
            name: name.to_string(),
            source,
        })?;
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = schemas
            .keys()
            .find(|existing| *existing != &schema && existing.as_str().eq_ignore_ascii_case(name))
        {
            return Err(RegistryError::SchemaNameConflict {
                name: name.to_string(),
                existing: existing.to_string(),
            });
        }
        tracing::debug!(schema = %schema, fields = definition.fields.len(), "registering schema");
        schemas.insert(schema, definition);
        Ok(())
    }

    /// Returns the compiled model for `name` scoped to `tenant`, compiling it on
    /// first use.
    pub fn get_model(&self, name: &str, tenant: &str) -> Result<Arc<CompiledModel>, RegistryError> {
        let tenant = TenantId::new(tenant.trim()).map_err(|source| RegistryError::InvalidTenant {
            tenant: tenant.to_string(),
            source,
        })?;
        let not_registered = || RegistryError::SchemaNotRegistered {
            name: name.to_string(),
        };
        let schema = SchemaName::new(name).map_err(|_| not_registered())?;

        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (schema, tenant);
        if let Some(model) = models.get(&key) {
            return Ok(Arc::clone(model));
        }

        let definition = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.0)
            .cloned()
            .ok_or_else(not_registered)?;
        let (schema, tenant) = key;
        let model = Arc::new(CompiledModel {
            collection: collection_name(&schema, &tenant),
            schema: schema.clone(),
            tenant: tenant.clone(),
            definition,
        });
        tracing::debug!(collection = %model.collection, "compiled tenant model");
        models.insert((schema, tenant), Arc::clone(&model));
        Ok(model)
    }

    /// Evicts cached models, for every tenant or only `tenant`.
    ///
    /// Returns the number of evicted models.
    pub fn clear_cache(&self, tenant: Option<&TenantId>) -> usize {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let before = models.len();
        match tenant {
            Some(tenant) => models.retain(|(_, model_tenant), _| model_tenant != tenant),
            None => models.clear(),
        }
        let evicted = before - models.len();
        tracing::debug!(evicted, tenant = ?tenant.map(TenantId::as_str), "cleared model cache");
        evicted
    }

    /// Registered schema names with their definitions, sorted by name.
    pub fn schemas(&self) -> Vec<(SchemaName, SchemaDefinition)> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, definition)| (name.clone(), definition.clone()))
            .collect()
    }

    pub fn schema_names(&self) -> Vec<SchemaName> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of compiled models currently cached.
    pub fn cached_models(&self) -> usize {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::new();
        registry
            .register_schema(
                "Bar",
                SchemaDefinition {
                    description: Some("bar records".into()),
                    fields: vec![FieldDefinition {
                        name: "ventas".into(),
                        data_type: Some(DataType::Number),
                    }],
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let err = registry().get_model("Unknown", "t1").unwrap_err();
        assert_eq!(
            err,
            RegistryError::SchemaNotRegistered {
                name: "Unknown".into()
            }
        );
        assert_eq!(err.to_string(), "schema not registered: Unknown");
    }

    #[test]
    fn empty_tenant_is_rejected() {
        let err = registry().get_model("Bar", "").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTenant { .. }));
        let err = registry().get_model("Bar", "   ").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTenant { .. }));
    }

    #[test]
    fn same_pair_returns_cached_handle() {
        let registry = registry();
        let first = registry.get_model("Bar", "t1").unwrap();
        let second = registry.get_model("Bar", "t1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.collection, "tenant_t1_bars");
        assert_eq!(registry.cached_models(), 1);
    }

    #[test]
    fn tenants_get_distinct_collections() {
        let registry = registry();
        let t1 = registry.get_model("Bar", "t1").unwrap();
        let t2 = registry.get_model("Bar", "t2").unwrap();
        assert_ne!(t1.collection, t2.collection);
        assert_eq!(t2.collection, "tenant_t2_bars");
    }

    #[test]
    fn reregistering_keeps_compiled_definition() {
        let registry = registry();
        let before = registry.get_model("Bar", "t1").unwrap();
        registry
            .register_schema("Bar", SchemaDefinition::default())
            .unwrap();

        let cached = registry.get_model("Bar", "t1").unwrap();
        assert!(Arc::ptr_eq(&before, &cached));
        assert_eq!(cached.definition.fields.len(), 1);

        let fresh = registry.get_model("Bar", "t2").unwrap();
        assert!(fresh.definition.fields.is_empty());
    }

    #[test]
    fn clear_cache_scoped_to_tenant() {
        let registry = registry();
        let t1 = registry.get_model("Bar", "t1").unwrap();
        registry.get_model("Bar", "t2").unwrap();

        let tenant = TenantId::new("t1").unwrap();
        assert_eq!(registry.clear_cache(Some(&tenant)), 1);
        assert_eq!(registry.cached_models(), 1);

        let recompiled = registry.get_model("Bar", "t1").unwrap();
        assert!(!Arc::ptr_eq(&t1, &recompiled));
        assert_eq!(t1.collection, recompiled.collection);

        assert_eq!(registry.clear_cache(None), 2);
        assert_eq!(registry.cached_models(), 0);
    }

    #[test]
    fn concurrent_first_access_converges() {
        let registry = registry();
        let handles: Vec<Arc<CompiledModel>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_model("Bar", "t1").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(handles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.cached_models(), 1);
    }

    #[test]
    fn invalid_schema_name_is_rejected_at_registration() {
        let err = ModelRegistry::new()
            .register_schema("bad name", SchemaDefinition::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchemaName { .. }));
    }

    #[test]
    fn schema_names_differing_by_case_are_rejected() {
        let registry = registry();
        let err = registry
            .register_schema("BAR", SchemaDefinition::default())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::SchemaNameConflict {
                name: "BAR".into(),
                existing: "Bar".into()
            }
        );
        assert_eq!(
            err.to_string(),
            "schema name \"BAR\" collides with registered schema \"Bar\""
        );
        assert!(matches!(
            registry.get_model("BAR", "t1"),
            Err(RegistryError::SchemaNotRegistered { .. })
        ));

        // Same spelling still replaces the definition.
        registry
            .register_schema("Bar", SchemaDefinition::default())
            .unwrap();
        assert_eq!(registry.schema_names().len(), 1);
    }

    #[test]
    fn uppercase_tenant_is_rejected() {
        let err = registry().get_model("Bar", "T1").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTenant { .. }));
    }

    #[test]
    fn schema_definition_from_json() {
        let def: SchemaDefinition = serde_json::from_str(
            r#"{"fields": [{"name": "fecha", "dataType": "date"}, {"name": "agente"}]}"#,
        )
        .unwrap();
        assert_eq!(def.fields[0].data_type, Some(DataType::Date));
        assert_eq!(def.fields[1].data_type, None);

        let registry = ModelRegistry::new();
        registry.register_schema("ProvisionRecord", def).unwrap();
        let names: Vec<String> = registry.schema_names().into_iter().map(String::from).collect();
        assert_eq!(names, vec!["ProvisionRecord"]);
    }
}
