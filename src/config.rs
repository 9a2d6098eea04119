//! Transfer configuration
//!
//! Loaded from a YAML (or JSON) file, then overridden by `BLOBXFER_STORE`
//! and `BLOBXFER_CACHE` from the environment.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::source::DEFAULT_CHUNK_CONCURRENCY;
use crate::{Error, Result};

pub const STORE_ENV: &str = "BLOBXFER_STORE";
pub const CACHE_ENV: &str = "BLOBXFER_CACHE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Root of the directory store.
    #[serde(default = "default_store")]
    pub store: PathBuf,
    /// Blob info cache file; no persistent cache when unset.
    #[serde(default)]
    pub cache: Option<PathBuf>,
    /// Chunks a source fetches in parallel.
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Name of the environment variable holding a registry bearer token.
    #[serde(default)]
    pub bearer_token_env: Option<String>,
}

fn default_store() -> PathBuf {
    PathBuf::from("blobxfer-store")
}

fn default_chunk_concurrency() -> usize {
    DEFAULT_CHUNK_CONCURRENCY
}

fn default_user_agent() -> String {
    concat!("blobxfer/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            cache: None,
            chunk_concurrency: default_chunk_concurrency(),
            user_agent: default_user_agent(),
            bearer_token_env: None,
        }
    }
}

impl TransferConfig {
    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(store) = lookup(STORE_ENV).filter(|v| !v.is_empty()) {
            self.store = PathBuf::from(store);
        }
        if let Some(cache) = lookup(CACHE_ENV).filter(|v| !v.is_empty()) {
            self.cache = Some(PathBuf::from(cache));
        }
        self
    }

    /// Resolve the configured bearer token, if any.
    pub fn bearer_token(&self) -> Option<String> {
        let var = self.bearer_token_env.as_deref()?;
        std::env::var(var).ok().filter(|t| !t.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<TransferConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let config: TransferConfig = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    } else {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &TransferConfig) -> Result<()> {
    if config.store.as_os_str().is_empty() {
        return Err(Error::Config("store cannot be empty".into()));
    }
    if config.chunk_concurrency == 0 {
        return Err(Error::Config("chunk_concurrency must be at least 1".into()));
    }
    if config.user_agent.trim().is_empty() {
        return Err(Error::Config("user_agent cannot be empty".into()));
    }
    if let Some(var) = &config.bearer_token_env {
        if var.trim().is_empty() {
            return Err(Error::Config("bearer_token_env cannot be empty".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "cfg.yaml", "store: /var/lib/blobs\n");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.store, PathBuf::from("/var/lib/blobs"));
        assert_eq!(cfg.chunk_concurrency, DEFAULT_CHUNK_CONCURRENCY);
        assert!(cfg.user_agent.starts_with("blobxfer/"));
        assert_eq!(cfg.cache, None);
    }

    #[test]
    fn json_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "cfg.json",
            r#"{"store": "s", "cache": "c.json", "chunk_concurrency": 8}"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.cache, Some(PathBuf::from("c.json")));
        assert_eq!(cfg.chunk_concurrency, 8);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "cfg.yml", "chunk_concurrency: 0\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("chunk_concurrency"));
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "cfg.yaml", "store: [unterminated\n");
        assert!(matches!(load_config(&path), Err(Error::Config(_))));
    }

    #[test]
    fn overrides_replace_file_values() {
        let cfg = TransferConfig::default().with_overrides(|key| match key {
            STORE_ENV => Some("/tmp/over".to_string()),
            CACHE_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(cfg.store, PathBuf::from("/tmp/over"));
        assert_eq!(cfg.cache, None);
    }
}
