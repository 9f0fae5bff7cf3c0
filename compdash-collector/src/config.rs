//! Collector configuration loaded from a YAML file.
//!
//! Path from `COMPDASH_COLLECTOR_CONFIG` (default `collector.yaml`);
//! missing or malformed files fall back to the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub update: UpdateConf,
    pub store: StoreConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConf {
    /// Release registry location, `owner/repo` form.
    pub github_repo: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    /// Overrides the default `machines.json` location. Mostly for tests and
    /// portable installs.
    pub path: Option<PathBuf>,
}

impl Default for UpdateConf {
    fn default() -> Self {
        Self {
            github_repo: "compdash-app/compdash".to_string(),
        }
    }
}

pub async fn load_config(explicit_path: Option<&Path>) -> CollectorConfig {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => std::env::var("COMPDASH_COLLECTOR_CONFIG")
            .unwrap_or_else(|_| "collector.yaml".into())
            .into(),
    };

    if !path.exists() {
        return CollectorConfig::default();
    }

    let text = fs::read_to_string(&path).await.unwrap_or_default();
    if text.trim().is_empty() {
        return CollectorConfig::default();
    }

    serde_yaml::from_str(&text).unwrap_or_else(|e| {
        warn!("invalid config at {}: {e}; using defaults", path.display());
        CollectorConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let cfg = load_config(Some(Path::new("/nonexistent/collector.yaml"))).await;
        assert_eq!(cfg.update.github_repo, "compdash-app/compdash");
        assert!(cfg.store.path.is_none());
    }

    #[tokio::test]
    async fn store_path_override_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.yaml");
        std::fs::write(&path, "store:\n  path: /tmp/machines.json\n").unwrap();

        let cfg = load_config(Some(&path)).await;
        assert_eq!(
            cfg.store.path.as_deref(),
            Some(Path::new("/tmp/machines.json"))
        );
    }
}
