//! Service location lookup

use crate::config::PubSubConfig;
use std::collections::HashMap;
use std::path::PathBuf;

/// Service name of the MQTT broker
pub const MQTT_SERVICE: &str = "mqtt";
/// Service name of the optional HTTP proxy in front of the broker
pub const MQTT_PROXY_SERVICE: &str = "mqtt_proxy";

/// Certificate paths registered for a service. Each may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCertificates {
    pub ca_cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub device_cert: Option<PathBuf>,
}

/// Resolves service names to locations and certificates
pub trait ServiceLocator: Send + Sync {
    /// Location URL of `service_name`, if known
    fn service_location(&self, service_name: &str) -> Option<String>;

    /// Certificates registered for `service_name`
    fn certificates(&self, service_name: &str) -> ServiceCertificates;
}

/// Locator backed by the loaded configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigServiceLocator {
    locations: HashMap<String, String>,
    certificates: HashMap<String, ServiceCertificates>,
}

impl ConfigServiceLocator {
    pub fn from_config(config: &PubSubConfig) -> Self {
        let mut locations = HashMap::new();
        locations.insert(MQTT_SERVICE.to_string(), config.services.mqtt.clone());
        if let Some(proxy) = &config.services.mqtt_proxy {
            locations.insert(MQTT_PROXY_SERVICE.to_string(), proxy.clone());
        }

        let certificates = config
            .certificates
            .iter()
            .map(|(name, section)| {
                (
                    name.clone(),
                    ServiceCertificates {
                        ca_cert: section.ca_cert.clone(),
                        key: section.key.clone(),
                        device_cert: section.device_cert.clone(),
                    },
                )
            })
            .collect();

        Self {
            locations,
            certificates,
        }
    }

    pub fn with_location(mut self, service_name: &str, location: impl Into<String>) -> Self {
        self.locations
            .insert(service_name.to_string(), location.into());
        self
    }

    pub fn with_certificates(mut self, service_name: &str, certificates: ServiceCertificates) -> Self {
        self.certificates
            .insert(service_name.to_string(), certificates);
        self
    }
}

impl ServiceLocator for ConfigServiceLocator {
    fn service_location(&self, service_name: &str) -> Option<String> {
        self.locations
            .get(service_name)
            .filter(|location| !location.trim().is_empty())
            .cloned()
    }

    fn certificates(&self, service_name: &str) -> ServiceCertificates {
        self.certificates
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}
