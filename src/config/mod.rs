use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// First-run configuration written to disk when no config file exists.
const DEFAULT_TEMPLATE: &str = include_str!("default_config.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPolicy {
    /// Every instance binds `basePort`; only one instance can run at a time.
    #[default]
    Fixed,
    /// Each instance gets `basePort + n` with `n` never reused.
    Incrementing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub model_dir: String,
    pub server_binary: String,
    pub host: String,
    pub base_port: u16,
    pub port_policy: PortPolicy,
    pub api_host: String,
    pub api_port: u16,
    #[serde(deserialize_with = "null_as_default")]
    pub default_args: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub model_specific_args: BTreeMap<String, Vec<String>>,
    #[serde(rename = "autoOpenWebEnabled")]
    pub auto_open_web: bool,
    pub notifications: bool,
    pub auto_start: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub auto_load_models: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub exclude_patterns: Vec<String>,
    pub recursive_scan: bool,
    pub readiness_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: "./models".to_string(),
            server_binary: "llama-server".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: 8080,
            port_policy: PortPolicy::Fixed,
            api_host: "0.0.0.0".to_string(),
            api_port: 9696,
            default_args: Vec::new(),
            model_specific_args: BTreeMap::new(),
            auto_open_web: false,
            notifications: true,
            auto_start: false,
            auto_load_models: Vec::new(),
            exclude_patterns: Vec::new(),
            recursive_scan: true,
            readiness_timeout_secs: 300,
            shutdown_timeout_secs: 30,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Config {
    /// Reads `path`, or materializes the embedded template there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} does not exist, creating default config", path.display());

            let config = Self::default_template()?;
            config.save(path)?;

            tracing::info!(
                model_dir = %config.model_dir,
                base_port = config.base_port,
                "Created default config file: {}",
                path.display()
            );
            return Ok(config);
        }

        let config = Self::load(path)?;
        tracing::info!(
            model_dir = %config.model_dir,
            base_port = config.base_port,
            auto_open_web = config.auto_open_web,
            "Config loaded from {}",
            path.display()
        );
        tracing::debug!("Default arguments: {:?}", config.default_args);
        tracing::debug!("Model-specific config count: {}", config.model_specific_args.len());
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| SupervisorError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Config =
            serde_json::from_str(content).map_err(|source| SupervisorError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_template() -> Result<Self> {
        Self::parse(DEFAULT_TEMPLATE, Path::new("<embedded default config>"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|source| {
            SupervisorError::ConfigParse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SupervisorError::ConfigIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, content).map_err(|source| SupervisorError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Config saved to: {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            return Err(SupervisorError::Config("basePort must be non-zero".to_string()));
        }
        if self.api_port == 0 {
            return Err(SupervisorError::Config("apiPort must be non-zero".to_string()));
        }
        if self.api_port == self.base_port {
            return Err(SupervisorError::Config(format!(
                "apiPort and basePort must differ (both are {})",
                self.api_port
            )));
        }
        if self.server_binary.trim().is_empty() {
            return Err(SupervisorError::Config("serverBinary must not be empty".to_string()));
        }
        for pattern in &self.exclude_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                SupervisorError::Config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// Model directory with a leading `~/` expanded to the home directory.
    pub fn model_dir_path(&self) -> PathBuf {
        if let Some(rest) = self.model_dir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.model_dir)
    }

    pub fn single_instance(&self) -> bool {
        self.port_policy == PortPolicy::Fixed
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Copies the fields that may change while the supervisor is running.
    ///
    /// Ports, the model directory and scan settings stay as they were at startup.
    pub fn apply_runtime_fields(&mut self, fresh: &Config) {
        self.server_binary = fresh.server_binary.clone();
        self.default_args = fresh.default_args.clone();
        self.model_specific_args = fresh.model_specific_args.clone();
        self.auto_open_web = fresh.auto_open_web;
        self.notifications = fresh.notifications;
    }
}
