//! Configuration system for the pub/sub bridge
//!
//! The TOML file describes where the broker lives (`[services]`), which
//! certificate material to use (`[certificates.<service>]`) and how the MQTT
//! connections are tuned (`[mqtt]`, `[reconnect]`). Service locations may be
//! overridden from the environment so containers can be repointed without
//! editing the file.

use crate::transport::mqtt::{MqttTuning, ReconnectConfig};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `services.mqtt`
pub const BROKER_URL_ENV: &str = "MQTT_BROKER_URL";
/// Environment variable overriding `services.mqtt_proxy`
pub const PROXY_URL_ENV: &str = "MQTT_PROXY_URL";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PubSubConfig {
    pub services: ServicesSection,
    #[serde(default)]
    pub certificates: HashMap<String, CertificateSection>,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Logical service name to URL mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicesSection {
    /// Broker URL, e.g. `mqtt://localhost:1883`
    pub mqtt: String,
    /// HTTP proxy URL; absent means no proxy
    pub mqtt_proxy: Option<String>,
}

/// Certificate file paths for one service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertificateSection {
    pub ca_cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub device_cert: Option<PathBuf>,
}

/// MQTT connection tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Prefix for generated client ids (`<prefix>-pub-<uuid>`)
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Capacity of the request queue between the facade and each event loop
    #[serde(default = "default_request_channel_capacity")]
    pub request_channel_capacity: usize,
    #[serde(default)]
    pub publish_qos: u8,
    #[serde(default)]
    pub subscribe_qos: u8,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive(),
            request_channel_capacity: default_request_channel_capacity(),
            publish_qos: 0,
            subscribe_qos: 0,
        }
    }
}

fn default_client_id_prefix() -> String {
    "pubsub".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_channel_capacity() -> usize {
    64
}

/// Delays between reconnection attempts of the background event loops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
    /// Failed attempts before a connection loop gives up; unset retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
            max_attempts: None,
        }
    }
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_sustained_delay() -> u64 {
    5000
}

/// Configuration errors
///
/// Everything here is fatal: a client must not be constructed from a
/// configuration that fails validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No hostname configured for the MQTT broker")]
    MissingHostname,
    #[error("Service location not found: {0}")]
    MissingService(String),
    #[error("Invalid URL for service {service}: {url}")]
    InvalidServiceUrl { service: String, url: String },
    #[error("Incomplete TLS material, missing: {}", .missing.join(", "))]
    IncompleteTls { missing: Vec<&'static str> },
    #[error("A proxy is only supported together with TLS material")]
    ProxyWithoutTls,
    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    #[error("Failed to read certificate {}: {source}", .path.display())]
    CertificateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PubSubConfig {
    /// Load configuration from TOML file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse and validate configuration without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PubSubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        qos_from_level(self.mqtt.publish_qos)?;
        qos_from_level(self.mqtt.subscribe_qos)?;

        if self.mqtt.request_channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.client_id_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = Self::get_env_var_optional(BROKER_URL_ENV) {
            self.services.mqtt = url;
        }
        if let Some(url) = Self::get_env_var_optional(PROXY_URL_ENV) {
            self.services.mqtt_proxy = Some(url);
        }
    }

    fn get_env_var_optional(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }

    /// Connection tuning derived from the `[mqtt]` and `[reconnect]` sections
    pub fn tuning(&self) -> Result<MqttTuning, ConfigError> {
        Ok(MqttTuning {
            client_id_prefix: self.mqtt.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            request_channel_capacity: self.mqtt.request_channel_capacity,
            publish_qos: qos_from_level(self.mqtt.publish_qos)?,
            subscribe_qos: qos_from_level(self.mqtt.subscribe_qos)?,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                backoff_pattern: self.reconnect.backoff_pattern_ms.clone(),
                sustained_delay: self.reconnect.sustained_delay_ms,
            },
        })
    }
}

/// Map a numeric QoS level from configuration to the protocol value
pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}
