//! Configuration loading and management

use anyhow::Context;
use kdbx_core::KdfLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upper bounds on the key derivation cost a file may request
    #[serde(default)]
    pub kdf: KdfLimits,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Group names left out of the dump, together with their subgroups
    #[serde(default = "default_excluded_groups")]
    pub excluded_groups: Vec<String>,
}

fn default_excluded_groups() -> Vec<String> {
    vec!["Old".to_string(), "Recycle Bin".to_string()]
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            excluded_groups: default_excluded_groups(),
        }
    }
}

impl Config {
    /// Load configuration from `explicit`, or else the standard locations,
    /// or else use defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let config_paths: Vec<PathBuf> = vec![
            Some(PathBuf::from("kdbx-dump.toml")),
            dirs_config_path(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::debug!("Using default configuration");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }
}

fn dirs_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("kdbx-dump").join("config.toml"))
}

/// The user's config directory
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
