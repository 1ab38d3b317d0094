//! Configuration loading and persistence.
//!
//! Node defaults live in `config.json` under the config directory and are
//! pushed onto a new server with [`crate::Bridge::apply_config`].
//! Environment variables override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::{fs, path::PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Node defaults applied to every server the binary creates.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// State directory for the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Hostname on the tailnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Auth key. Prefer the environment over writing this to disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authkey: Option<String>,
    /// Coordination server URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    /// Register nodes as ephemeral.
    pub ephemeral: bool,
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `TSNET_BRIDGE_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir + `tsnet-bridge`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("TSNET_BRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("tsnet-bridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from_dir(&dir).unwrap_or_else(|e| {
            log::debug!("[config] using defaults: {e:#}");
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read `config.json` from `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("TSNET_BRIDGE_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(hostname) = var("TSNET_BRIDGE_HOSTNAME") {
            self.hostname = Some(hostname);
        }
        if let Some(key) = var("TSNET_BRIDGE_AUTHKEY").or_else(|| var("TS_AUTHKEY")) {
            self.authkey = Some(key);
        }
        if let Some(url) = var("TSNET_BRIDGE_CONTROL_URL") {
            self.control_url = Some(url);
        }
        if let Some(ephemeral) = var("TSNET_BRIDGE_EPHEMERAL") {
            self.ephemeral = matches!(ephemeral.as_str(), "1" | "true");
        }
    }

    /// Persists the current configuration to `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", config_path.display()))?;

        // The file may hold an auth key.
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }
}
