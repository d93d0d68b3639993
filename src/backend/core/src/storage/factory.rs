use super::{
    Backing, FlatFileBacking, JsonFormat, MemoryBacking, RedisBacking, SplitBacking, SqlBacking, Storage, StorageType,
    YamlFormat, SPLIT_KEYS,
};
use crate::config::StorageConfig;
use crate::error::{PermsError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info};

/// Builds the [`Storage`] described by configuration.
pub struct StorageFactory;

impl StorageFactory {
    /// Method used when a configured one is not recognised.
    pub const DEFAULT_TYPE: StorageType = StorageType::Json;

    /// The storage type of every entity kind.
    ///
    /// Without split storage every kind uses `storage.method`. Unrecognised
    /// or missing methods fall back to [`Self::DEFAULT_TYPE`].
    pub fn routing(config: &StorageConfig) -> HashMap<String, StorageType> {
        if !config.split_storage {
            let kind = StorageType::parse(&config.method).unwrap_or_else(|| {
                error!(
                    method = %config.method,
                    fallback = %Self::DEFAULT_TYPE,
                    "Storage method not recognised, using the default instead"
                );
                Self::DEFAULT_TYPE
            });
            return SPLIT_KEYS.iter().map(|k| (k.to_string(), kind)).collect();
        }

        SPLIT_KEYS
            .iter()
            .map(|key| {
                let kind = match config.split_storage_options.get(*key) {
                    Some(method) => StorageType::parse(method).unwrap_or_else(|| {
                        error!(
                            entity = *key,
                            method = %method,
                            fallback = %Self::DEFAULT_TYPE,
                            "Storage method not recognised, using the default instead"
                        );
                        Self::DEFAULT_TYPE
                    }),
                    None => {
                        error!(entity = *key, fallback = %Self::DEFAULT_TYPE, "No storage method configured");
                        Self::DEFAULT_TYPE
                    }
                };
                (key.to_string(), kind)
            })
            .collect()
    }

    /// Distinct storage types that must be instantiated.
    pub fn required_types(config: &StorageConfig) -> BTreeSet<StorageType> {
        Self::routing(config).into_values().collect()
    }

    /// Create, wrap and initialise the configured storage.
    pub async fn build(config: &StorageConfig) -> Result<Storage> {
        let routing = Self::routing(config);
        let required: BTreeSet<StorageType> = routing.values().copied().collect();

        let backing: Arc<dyn Backing> = if config.split_storage {
            info!(types = ?required, "Using split storage");
            let mut backings: BTreeMap<StorageType, Arc<dyn Backing>> = BTreeMap::new();
            for kind in &required {
                backings.insert(*kind, Self::make_backing(*kind, config).await?);
            }
            Arc::new(SplitBacking::new(backings, &routing)?)
        } else {
            let kind = required.iter().next().copied().unwrap_or(Self::DEFAULT_TYPE);
            Self::make_backing(kind, config).await?
        };

        info!(backing = backing.name(), "Initialising storage");
        let storage = Storage::new(backing, config.operation_timeout);
        storage.init().await?;
        Ok(storage)
    }

    /// One concrete backing.
    pub async fn make_backing(kind: StorageType, config: &StorageConfig) -> Result<Arc<dyn Backing>> {
        let backing: Arc<dyn Backing> = match kind {
            StorageType::Json => Arc::new(FlatFileBacking::<JsonFormat>::new(&config.data_directory)),
            StorageType::Yaml => Arc::new(FlatFileBacking::<YamlFormat>::new(&config.data_directory)),
            StorageType::Memory => Arc::new(MemoryBacking::new()),
            StorageType::Redis => Arc::new(RedisBacking::new(&config.redis.url, &config.redis.key_prefix)?),
            StorageType::Sqlite => {
                let url = match config.database.url.as_deref() {
                    Some(url) if url.starts_with("sqlite:") => url.to_string(),
                    _ => {
                        tokio::fs::create_dir_all(&config.data_directory).await?;
                        format!(
                            "sqlite://{}?mode=rwc",
                            config.data_directory.join("permstack.sqlite").display()
                        )
                    }
                };
                Arc::new(SqlBacking::connect(kind, &url, &config.database).await?)
            }
            StorageType::Postgres => {
                let url = config.database.url.as_deref().ok_or_else(|| {
                    PermsError::configuration("storage.database.url is required for postgresql")
                })?;
                Arc::new(SqlBacking::connect(kind, url, &config.database).await?)
            }
        };
        Ok(backing)
    }
}
