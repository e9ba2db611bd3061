use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::bundle::Bucket;
use crate::store::LocalSyncStore;

const CONFIG_DIR_NAME: &str = "edugo";
const CONFIG_FILE_NAME: &str = "sync.toml";

/// Sync client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
}

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL the `/sync/...` paths are appended to
    pub base_url: String,
    /// Bearer token sent on every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

/// Local sync behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bundle database path (empty = default data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Recompute bucket hashes and reject mismatches
    pub verify_hashes: bool,
    /// Buckets refreshed by `edugo-sync buckets` when none are given
    pub default_buckets: Vec<Bucket>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            verify_hashes: false,
            default_buckets: vec![Bucket::Menu, Bucket::Permissions],
        }
    }
}

impl SyncConfig {
    /// Resolved bundle database path
    pub fn db_path(&self) -> Result<PathBuf> {
        match self.db_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => Ok(PathBuf::from(path)),
            None => LocalSyncStore::default_path().context("Failed to get data directory"),
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(CONFIG_DIR_NAME);

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            tracing::info!("Wrote default config to {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.base_url, "http://localhost:8080/api/v1");
        assert!(config.server.token.is_none());
        assert_eq!(config.server.timeout_secs, 30);
        assert!(config.sync.db_path.is_none());
        assert!(!config.sync.verify_hashes);
        assert_eq!(config.sync.default_buckets, vec![Bucket::Menu, Bucket::Permissions]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[server]
base_url = "https://edugo.example.test/api"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.server.base_url, "https://edugo.example.test/api");
        assert_eq!(config.server.timeout_secs, 30);
        assert!(!config.sync.verify_hashes);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[server]
base_url = "https://edugo.example.test/api"
token = "secret"
timeout_secs = 10

[sync]
db_path = "/var/lib/edugo/sync.redb"
verify_hashes = true
default_buckets = ["screens", "available_contexts"]
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.server.timeout_secs, 10);
        assert!(config.sync.verify_hashes);
        assert_eq!(
            config.sync.default_buckets,
            vec![Bucket::Screens, Bucket::AvailableContexts]
        );
        assert_eq!(
            config.sync.db_path().unwrap(),
            PathBuf::from("/var/lib/edugo/sync.redb")
        );
    }

    #[test]
    fn test_unknown_bucket_in_config_is_an_error() {
        let toml_str = r#"
[sync]
default_buckets = ["menu", "features"]
"#;
        let result: Result<Config, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Config = toml::from_str(&example).unwrap();
        assert_eq!(parsed.server.base_url, Config::default().server.base_url);
        assert!(example.contains("default_buckets"));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }
}
