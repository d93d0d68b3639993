//! Configuration management.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifier of this server, contributed to every query context.
    /// `"global"` means no server context.
    #[serde(default = "default_server")]
    pub server: String,

    /// Group every user falls back to as primary group
    #[serde(default = "default_group")]
    pub default_group: String,

    /// Resolution configuration
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            default_group: default_group(),
            resolution: ResolutionConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionConfig {
    /// Whether wildcard nodes take part in permission lookups
    #[serde(default = "default_true")]
    pub apply_wildcards: bool,

    /// Whether `group.<name>` entries are synthesized for the inheritance chain
    #[serde(default = "default_true")]
    pub apply_group_pseudo_permissions: bool,

    /// Contexts added to every query built by the service
    #[serde(default)]
    pub static_contexts: BTreeMap<String, String>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            apply_wildcards: true,
            apply_group_pseudo_permissions: true,
            static_contexts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Interval of the background refresh of cached contexts (disabled if unset)
    #[serde(default, with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage method used when split storage is off
    #[serde(default = "default_storage_method")]
    pub method: String,

    /// Route entity types to different methods
    #[serde(default)]
    pub split_storage: bool,

    /// Entity type (`user`, `group`, `track`, `uuid`, `log`) to storage method
    #[serde(default)]
    pub split_storage_options: HashMap<String, String>,

    /// Root directory of the flat-file backings
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Relational database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Upper bound for a single storage operation
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            method: default_storage_method(),
            split_storage: false,
            split_storage_options: HashMap::new(),
            data_directory: default_data_directory(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL for PostgreSQL. SQLite uses a file in the data directory
    /// unless a `sqlite:` URL is given here.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Prefix of every table name
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            table_prefix: default_table_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix of every key
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level / filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Install the Prometheus recorder
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_enabled: true,
        }
    }
}

// Default value functions
fn default_server() -> String { "global".to_string() }
fn default_group() -> String { "default".to_string() }
fn default_true() -> bool { true }
fn default_storage_method() -> String { "json".to_string() }
fn default_data_directory() -> PathBuf { PathBuf::from("data") }
fn default_operation_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_table_prefix() -> String { "permstack_".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_redis_prefix() -> String { "permstack:".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from the environment (and a `.env` file if present).
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PERMSTACK").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PERMSTACK").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// The server context value, if this instance is not global.
    pub fn server_context(&self) -> Option<&str> {
        if self.server.is_empty() || self.server.eq_ignore_ascii_case("global") {
            None
        } else {
            Some(&self.server)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.default_group, "default");
        assert_eq!(config.storage.method, "json");
        assert!(!config.storage.split_storage);
        assert!(config.resolution.apply_wildcards);
        assert_eq!(config.storage.operation_timeout, Duration::from_secs(10));
        assert!(config.cache.refresh_interval.is_none());
        assert!(config.server_context().is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server = "survival"
default_group = "member"

[cache]
refresh_interval = "30s"

[storage]
method = "sqlite"
split_storage = true
operation_timeout = "2s"

[storage.split_storage_options]
user = "json"
group = "sqlite"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server_context(), Some("survival"));
        assert_eq!(config.default_group, "member");
        assert_eq!(config.cache.refresh_interval, Some(Duration::from_secs(30)));
        assert!(config.storage.split_storage);
        assert_eq!(config.storage.operation_timeout, Duration::from_secs(2));
        assert_eq!(
            config.storage.split_storage_options.get("group").map(String::as_str),
            Some("sqlite")
        );
    }
}
