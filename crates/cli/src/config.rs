use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use connection::RetryConfig;
use serde::{Deserialize, Serialize};

pub const CMDSEQ_DIR: &str = ".cmdseq";
pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmdseqConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
        }
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CMDSEQ_DIR).join(CONFIG_FILE)
}

impl CmdseqConfig {
    /// Load `<root>/.cmdseq/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Write the config under `root`. Returns false if one already exists.
    pub async fn init(root: &Path) -> Result<bool> {
        let path = config_path(root);
        if path.exists() {
            return Ok(false);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = toml::to_string_pretty(&Self::default())?;
        tokio::fs::write(&path, content).await?;
        Ok(true)
    }
}
