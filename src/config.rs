//! Gateway configuration
//!
//! One JSON file, read once at startup. Each component takes its own
//! section by value; nothing here is global.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::archive::ArchiveConfig;
use crate::callback::CallbackConfig;
use crate::pipeline::PipelineConfig;
use crate::providers::retry::ReadRetryConfig;

pub const ENV_MAX_UPLOAD_SIZE: &str = "GATEWAY_MAX_UPLOAD_SIZE";
pub const ENV_CALLBACK_MAX_ATTEMPTS: &str = "GATEWAY_CALLBACK_MAX_ATTEMPTS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pipeline: PipelineConfig,
    pub callback: CallbackConfig,
    pub read_retry: ReadRetryConfig,
    pub archive: ArchiveConfig,
}

impl GatewayConfig {
    /// Clamp every section into safe bounds
    pub fn validate(&mut self) {
        self.pipeline.validate();
        self.callback.validate();
        self.archive.validate();
        self.read_retry.max_retries = self.read_retry.max_retries.min(5);
    }

    /// Apply `GATEWAY_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_MAX_UPLOAD_SIZE) {
            match raw.trim() {
                "" | "0" | "unlimited" => self.pipeline.max_upload_size = None,
                value => match value.parse::<u64>() {
                    Ok(limit) => self.pipeline.max_upload_size = Some(limit),
                    Err(_) => tracing::warn!("[Config] Ignoring {}={:?}", ENV_MAX_UPLOAD_SIZE, raw),
                },
            }
        }
        if let Some(raw) = lookup(ENV_CALLBACK_MAX_ATTEMPTS) {
            match raw.trim().parse::<u32>() {
                Ok(attempts) => self.callback.max_attempts = attempts,
                Err(_) => tracing::warn!("[Config] Ignoring {}={:?}", ENV_CALLBACK_MAX_ATTEMPTS, raw),
            }
        }
    }
}

/// `<config_dir>/storage-gateway/config.json`
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("storage-gateway").join("config.json")
}

/// Load configuration, falling back to defaults when the file is missing or
/// unreadable. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> GatewayConfig {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let mut config = read_file(&config_path).unwrap_or_default();
    config.apply_env();
    config.validate();
    config
}

fn read_file(path: &Path) -> Option<GatewayConfig> {
    if !path.exists() {
        tracing::warn!("[Config] {} not found, using defaults", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(config) => {
                tracing::info!("[Config] Loaded {}", path.display());
                Some(config)
            }
            Err(e) => {
                tracing::warn!("[Config] Failed to parse {}: {}. Using defaults", path.display(), e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("[Config] Failed to read {}: {}. Using defaults", path.display(), e);
            None
        }
    }
}

pub fn save_config(config: &GatewayConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("[Config] Saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_file(&dir.path().join("absent.json"));
        assert!(config.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = GatewayConfig::default();
        config.pipeline.max_upload_size = Some(1024);
        config.callback.max_attempts = 7;
        save_config(&config, &path).unwrap();

        assert_eq!(read_file(&path), Some(config));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"callback": {"max_attempts": 2}}"#).unwrap();

        let config = read_file(&path).unwrap();
        assert_eq!(config.callback.max_attempts, 2);
        assert_eq!(config.callback.timeout_secs, CallbackConfig::default().timeout_secs);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(read_file(&path).is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_UPLOAD_SIZE, "2048"),
            (ENV_CALLBACK_MAX_ATTEMPTS, "9"),
        ]
        .into_iter()
        .collect();
        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.pipeline.max_upload_size, Some(2048));
        assert_eq!(config.callback.max_attempts, 9);

        config.apply_overrides(|key| (key == ENV_MAX_UPLOAD_SIZE).then(|| "unlimited".to_string()));
        assert_eq!(config.pipeline.max_upload_size, None);

        config.apply_overrides(|key| (key == ENV_CALLBACK_MAX_ATTEMPTS).then(|| "many".to_string()));
        assert_eq!(config.callback.max_attempts, 9);
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = GatewayConfig::default();
        config.callback.max_attempts = 0;
        config.pipeline.chunk_size = 1;
        config.read_retry.max_retries = 100;
        config.validate();
        assert_eq!(config.callback.max_attempts, 1);
        assert!(config.pipeline.chunk_size >= 4096);
        assert_eq!(config.read_retry.max_retries, 5);
    }
}
