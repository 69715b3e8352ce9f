//! Configuration management for the GPU agent
//!
//! Handles:
//! - MQTT broker settings and credentials
//! - Publication topic, Home Assistant discovery, heartbeat
//! - nvidia-smi location and polling interval
//! - Cross-platform storage, with environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::gate::DEFAULT_HEARTBEAT;
use crate::sources::DEFAULT_POLL_INTERVAL;
use crate::supervisor::DEFAULT_SHUTDOWN_GRACE;

/// Overrides the config file location
pub const CONFIG_PATH_ENV: &str = "SYMBION_GPU_CONFIG";

const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("broker address is required")]
    MissingBroker,
    #[error("topic is required")]
    MissingTopic,
    #[error("poll interval must be at least 100 ms, got {0} ms")]
    PollIntervalTooShort(u64),
    #[error("heartbeat must be at least 1 second")]
    HeartbeatTooShort,
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("could not find config directory")]
    NoConfigDir,
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub publish: PublishConfig,
    pub gpu: GpuConfig,
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub base_topic: String,
    /// Publish Home Assistant discovery configs at startup
    pub homeassistant: bool,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub smi_path: PathBuf,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub shutdown_grace_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 5,
            publish_timeout_secs: 5,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_topic: "smi2mqtt".to_string(),
            homeassistant: true,
            heartbeat_secs: DEFAULT_HEARTBEAT.as_secs(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            smi_path: PathBuf::from("nvidia-smi"),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
        }
    }
}

impl AgentConfig {
    /// Load config from a file; a missing file yields the defaults
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config = toml::from_str(&content)?;
            debug!(path = %path.display(), "loaded config file");
            Ok(config)
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save config, generating a client id on first save
    pub async fn save_to(&mut self, path: &Path) -> Result<(), ConfigError> {
        if self.mqtt.client_id.is_none() {
            self.mqtt.client_id = Some(format!("symbion-gpu-{}", uuid::Uuid::new_v4()));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get the config file path, honouring `$SYMBION_GPU_CONFIG`
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("symbion-agent-gpu");
        path.push("config.toml");
        Ok(path)
    }

    /// Apply `SYMBION_*` environment overrides on top of the file values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(host) = lookup("SYMBION_MQTT_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = lookup("SYMBION_MQTT_PORT") {
            self.mqtt.broker_port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "SYMBION_MQTT_PORT",
                value: port,
            })?;
        }
        if let Some(username) = lookup("SYMBION_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("SYMBION_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = lookup("SYMBION_GPU_TOPIC") {
            self.publish.base_topic = topic;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_host.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        if self.publish.base_topic.trim().is_empty() {
            return Err(ConfigError::MissingTopic);
        }
        if self.gpu.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::PollIntervalTooShort(self.gpu.poll_interval_ms));
        }
        if self.publish.heartbeat_secs == 0 {
            return Err(ConfigError::HeartbeatTooShort);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.gpu.poll_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.publish.heartbeat_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.agent.shutdown_grace_secs)
    }
}
