//! Application configuration.
//!
//! Aggregates messaging and cache settings into a single `Config` that can
//! be loaded from YAML files or environment variables.

mod cache;
mod messaging;

pub use cache::{CacheConfig, CacheType};
pub use messaging::{MessagingConfig, MessagingType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SOCIALMESH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SOCIALMESH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SOCIALMESH_LOG";
/// Legacy broker URL variable.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
/// Legacy cache URL variable.
pub const REDIS_URL_ENV_VAR: &str = "REDIS_URL";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub messaging: MessagingConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `RABBITMQ_URL` / `REDIS_URL` legacy variables (as defaults)
    /// 2. `config.yaml` in current directory (if exists)
    /// 3. File specified by `path` argument (if provided)
    /// 4. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 5. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        if let Ok(url) = std::env::var(RABBITMQ_URL_ENV_VAR) {
            builder = builder.set_default("messaging.url", url)?;
        }
        if let Ok(url) = std::env::var(REDIS_URL_ENV_VAR) {
            builder = builder.set_default("cache.url", url)?;
        }

        builder = builder
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, without consulting files or the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid("messaging.exchange must not be empty".into()));
        }
        if self.messaging.messaging_type == MessagingType::Amqp && self.messaging.url.is_empty() {
            return Err(ConfigError::Invalid("messaging.url must not be empty".into()));
        }
        let ttls = [
            ("cache.item_ttl_secs", self.cache.item_ttl_secs),
            ("cache.listing_ttl_secs", self.cache.listing_ttl_secs),
            ("cache.search_ttl_secs", self.cache.search_ttl_secs),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        Ok(())
    }

    /// In-memory broker and cache, for tests and local runs.
    pub fn for_test() -> Self {
        Self {
            messaging: MessagingConfig {
                messaging_type: MessagingType::Memory,
                ..Default::default()
            },
            cache: CacheConfig {
                cache_type: CacheType::Memory,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::bus::BackoffKind;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.url, "amqp://localhost:5672");
        assert_eq!(config.messaging.exchange, "socialmedia_events");
        assert_eq!(config.messaging.max_connect_retries, 10);
        assert_eq!(config.messaging.retry_delay_ms, 3000);
        assert_eq!(config.cache.url, "redis://localhost:6379");
        assert_eq!(config.cache.item_ttl_secs, 3600);
        assert_eq!(config.cache.listing_ttl_secs, 300);
        assert_eq!(config.cache.search_ttl_secs, 120);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = MessagingConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.initial_delay, Duration::from_secs(3));
        assert_eq!(policy.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_topology_includes_dead_letter_when_enabled() {
        let yaml = r#"
messaging:
  exchange: events
  prefetch: 4
  dead_letter:
    enabled: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let topology = config.messaging.topology();
        assert_eq!(topology.exchange, "events");
        assert_eq!(topology.prefetch, 4);
        assert_eq!(topology.dead_letter.unwrap().queue, "events.dlq");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
messaging:
  backoff: exponential
  max_connect_retries: 3
cache:
  type: memory
  listing_ttl_secs: 60
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.messaging.backoff, BackoffKind::Exponential);
        assert_eq!(config.messaging.max_connect_retries, 3);
        assert_eq!(config.messaging.retry_delay_ms, 3000);
        assert_eq!(config.cache.cache_type, CacheType::Memory);
        assert_eq!(config.cache.ttls().listing, Duration::from_secs(60));
        assert_eq!(config.cache.ttls().item, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let err = Config::from_yaml("cache:\n  search_ttl_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("cache.search_ttl_secs"));
    }

    #[test]
    fn test_empty_exchange_rejected() {
        assert!(Config::from_yaml("messaging:\n  exchange: \"\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "messaging:\n  url: amqp://rabbit:5672\n  retry_delay_ms: 500\ncache:\n  url: redis://cache:6379"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.messaging.url, "amqp://rabbit:5672");
        assert_eq!(config.messaging.retry_delay_ms, 500);
        assert_eq!(config.cache.url, "redis://cache:6379");
        assert_eq!(config.cache.item_ttl_secs, 3600);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load(Some("/nonexistent/socialmesh.yaml")).is_err());
    }

    #[test]
    fn test_for_test_uses_memory_backends() {
        let config = Config::for_test();
        assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
        assert_eq!(config.cache.cache_type, CacheType::Memory);
    }
}
