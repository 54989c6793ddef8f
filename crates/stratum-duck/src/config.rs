//! Configuration for the storage engine
//!
//! Loaded from a YAML file; environment variables always override the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Database location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file; `None` keeps everything in memory
    #[serde(default)]
    pub path: Option<String>,
}

/// Ingestion batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per transaction when caching composite documents
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records per transaction for `load` and `reassign`
    #[serde(default = "default_load_batch_size")]
    pub load_batch_size: usize,
}

fn default_batch_size() -> usize {
    2000
}

fn default_load_batch_size() -> usize {
    1000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            load_batch_size: default_load_batch_size(),
        }
    }
}

/// Settings consumed by `logging::init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `stratum_duck=debug`
    pub level: String,

    /// `pretty`, `json` or `compact`
    pub format: String,

    /// `stdout`, `file` or `both`
    pub output: String,

    /// Where rolling files are written
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read `path` as YAML, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("STRATUM_DB_PATH") {
            self.database.path = Some(path);
        }
        if let Ok(size) = std::env::var("STRATUM_BATCH_SIZE") {
            if let Ok(size) = size.parse() {
                self.ingest.batch_size = size;
            }
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.database.path.is_none());
        assert_eq!(config.ingest.batch_size, 2000);
        assert_eq!(config.ingest.load_batch_size, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "stdout");
    }

    #[test]
    fn test_partial_yaml_and_env_override() {
        std::env::set_var("STRATUM_BATCH_SIZE", "50");

        let config_yaml = r#"
database:
  path: "/tmp/stratum-test.db"
ingest:
  load_batch_size: 10
"#;
        let temp_file = std::env::temp_dir().join("stratum_test_config.yaml");
        std::fs::write(&temp_file, config_yaml).unwrap();

        let config = Config::load(&temp_file).unwrap();
        assert_eq!(config.database.path.as_deref(), Some("/tmp/stratum-test.db"));
        assert_eq!(config.ingest.batch_size, 50); // Overridden
        assert_eq!(config.ingest.load_batch_size, 10);
        assert_eq!(config.logging.directory, "./logs");

        std::env::remove_var("STRATUM_BATCH_SIZE");
        std::fs::remove_file(temp_file).ok();
    }
}
