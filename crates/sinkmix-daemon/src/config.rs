// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the daemon.

use serde::{Deserialize, Serialize};
use sinkmix::{CoreConfig, SampleFormat};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "daemon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// A sink that renders its inputs at the device pace and throws the result
/// away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullSinkConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_format")]
    pub format: SampleFormat,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Bytes rendered per wake-up.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub volume_db: f64,
    #[serde(default)]
    pub muted: bool,
}

impl NullSinkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            format: default_format(),
            rate: default_rate(),
            channels: default_channels(),
            block_size: default_block_size(),
            volume_db: 0.0,
            muted: false,
        }
    }
}

fn default_format() -> SampleFormat {
    SampleFormat::S16le
}

fn default_rate() -> u32 {
    44_100
}

fn default_channels() -> u8 {
    2
}

fn default_block_size() -> usize {
    4_096
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    5
}

/// Suspending sinks nobody uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleSuspendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_idle_timeout")]
    pub timeout_secs: u64,
}

impl Default for IdleSuspendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<NullSinkConfig>,
    #[serde(default)]
    pub idle_suspend: IdleSuspendConfig,
}

fn default_sinks() -> Vec<NullSinkConfig> {
    let mut sink = NullSinkConfig::new("null");
    sink.description = Some("Null Output".to_string());
    vec![sink]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            sinks: default_sinks(),
            idle_suspend: IdleSuspendConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Manages configuration file loading and saving.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("org", "sinkmix", "sinkmix")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(config_dir)
    }

    /// Uses `dir` instead of the per-user config directory.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No daemon config found, using defaults");
            return Ok(DaemonConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = DaemonConfig::from_toml(&content)?;
        info!("Loaded daemon config from {:?}", path);
        Ok(config)
    }

    #[allow(dead_code)]
    pub fn save(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("Saved daemon config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        let config = manager.load().unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.sinks.len(), 1);
        assert_eq!(config.sinks[0].name, "null");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("nested")).unwrap();

        let mut config = DaemonConfig::default();
        config.idle_suspend.timeout_secs = 30;
        let mut sink = NullSinkConfig::new("speakers");
        sink.format = SampleFormat::F32le;
        sink.volume_db = -6.0;
        config.sinks.push(sink);
        manager.save(&config).unwrap();

        assert_eq!(manager.load().unwrap(), config);
    }

    #[test]
    fn test_partial_file() {
        let config = DaemonConfig::from_toml(
            r#"
            [idle_suspend]
            enabled = false

            [[sinks]]
            name = "a"
            format = "f32le"
            rate = 48000
            "#,
        )
        .unwrap();

        assert!(!config.idle_suspend.enabled);
        assert_eq!(config.idle_suspend.timeout_secs, 5);
        assert_eq!(config.sinks.len(), 1);
        assert_eq!(config.sinks[0].format, SampleFormat::F32le);
        assert_eq!(config.sinks[0].rate, 48_000);
        assert_eq!(config.sinks[0].channels, 2);
        assert!(config.core.flat_volumes);
    }

    #[test]
    fn test_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "sinks = 3").unwrap();
        assert!(matches!(manager.load(), Err(ConfigError::TomlParse(_))));
    }
}
