//! Configuration loading and management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use tally_core::{AggregationPolicy, ModelRegistry, RegistryError, SchemaDefinition};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Schemas registered at startup, keyed by schema name.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaDefinition>,

    /// Grouping and `min` behavior for `query`.
    #[serde(default)]
    pub aggregation: AggregationPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("tally.db"),
            schemas: BTreeMap::new(),
            aggregation: AggregationPolicy::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (TALLY_*)
        figment = figment.merge(Env::prefixed("TALLY_"));

        figment.extract()
    }

    /// Builds a registry holding every configured schema.
    pub fn registry(&self) -> Result<ModelRegistry, RegistryError> {
        let registry = ModelRegistry::new();
        for (name, definition) in &self.schemas {
            registry.register_schema(name, definition.clone())?;
        }
        Ok(registry)
    }
}

/// Returns the platform-specific config directory for tally.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tally"))
}

/// Returns the platform-specific data directory for tally.
///
/// On Linux: `~/.local/share/tally`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tally"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tally_core::{BucketOrder, DataType, MinPolicy};

    #[test]
    fn test_dirs_data_path_ends_with_tally() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "tally");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("tally.db"));
        assert!(config.schemas.is_empty());
        assert_eq!(config.aggregation, AggregationPolicy::default());
    }

    #[test]
    fn test_config_file_declares_schemas_and_policy() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
database_path = "/tmp/tally-test.db"

[aggregation]
bucket_order = "label"
min_policy = "all_values"

[schemas.Bar]
description = "Bar reports"
fields = [
    { name = "fecha", dataType = "date" },
    { name = "ventas", dataType = "number" },
    { name = "agente" },
]
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/tally-test.db"));
        assert_eq!(config.aggregation.bucket_order, BucketOrder::Label);
        assert_eq!(config.aggregation.min_policy, MinPolicy::AllValues);

        let bar = &config.schemas["Bar"];
        assert_eq!(bar.fields.len(), 3);
        assert_eq!(bar.fields[0].data_type, Some(DataType::Date));
        assert_eq!(bar.fields[2].data_type, None);

        let registry = config.registry().unwrap();
        let model = registry.get_model("Bar", "acme").unwrap();
        assert_eq!(model.collection, "tenant_acme_bars");
    }

    #[test]
    fn test_invalid_schema_name_fails_registry() {
        let mut config = Config::default();
        config
            .schemas
            .insert("not valid".to_string(), SchemaDefinition::default());
        assert!(matches!(
            config.registry(),
            Err(RegistryError::InvalidSchemaName { .. })
        ));
    }
}
