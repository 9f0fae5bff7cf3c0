//! Agent configuration loaded from a YAML file.
//!
//! The path comes from `COMPDASH_AGENT_CONFIG` (default `agent.yaml` next to
//! the working directory). A missing or malformed file falls back to the
//! defaults rather than aborting; the agent must come up on an unconfigured
//! machine.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConf,
    pub update: UpdateConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    /// First port the listener tries; retries walk upward from here.
    pub base_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConf {
    /// Release registry location, `owner/repo` form.
    pub github_repo: String,
    /// When false the agent only logs that an update exists.
    pub auto_update: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            update: UpdateConf::default(),
        }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            base_port: compdash_proto::DEFAULT_AGENT_PORT,
        }
    }
}

impl Default for UpdateConf {
    fn default() -> Self {
        Self {
            github_repo: "compdash-app/compdash".to_string(),
            auto_update: true,
        }
    }
}

pub async fn load_config(explicit_path: Option<&Path>) -> AgentConfig {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => std::env::var("COMPDASH_AGENT_CONFIG")
            .unwrap_or_else(|_| "agent.yaml".into())
            .into(),
    };

    if !path.exists() {
        return AgentConfig::default();
    }

    let text = fs::read_to_string(&path).await.unwrap_or_default();
    if text.trim().is_empty() {
        return AgentConfig::default();
    }

    serde_yaml::from_str(&text).unwrap_or_else(|e| {
        warn!("invalid config at {}: {e}; using defaults", path.display());
        AgentConfig::default()
    })
}
