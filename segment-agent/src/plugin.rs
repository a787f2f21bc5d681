//! Storage plugin handoff.
//!
//! The plugin owns off-node persistence; the agent only ever hands it a
//! config path and a local file path and expects the file to exist locally
//! afterwards (restore) or to have been shipped (backup). The plugin's wire
//! format is its own business.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AgentError, Result};

#[derive(Debug, Deserialize)]
pub struct PluginConfig {
    pub executable: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<PluginConfig> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

pub async fn backup_file(config_path: &Path, file: &Path) -> Result<()> {
    invoke("backup_file", config_path, file).await
}

pub async fn restore_file(config_path: &Path, file: &Path) -> Result<()> {
    invoke("restore_file", config_path, file).await
}

async fn invoke(action: &str, config_path: &Path, file: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    debug!(
        "Invoking plugin {} {action} for {}",
        config.executable.display(),
        file.display()
    );
    let output = Command::new(&config.executable)
        .arg(action)
        .arg(config_path)
        .arg(file)
        .output()
        .await?;
    if !output.status.success() {
        return Err(AgentError::Plugin {
            executable: config.executable.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
