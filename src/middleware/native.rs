//! Middleware that talks to the broker directly over MQTT

use super::locator::{ServiceLocator, MQTT_PROXY_SERVICE, MQTT_SERVICE};
use crate::config::ConfigError;
use crate::error::PubSubResult;
use crate::transport::mqtt::{
    BrokerEndpoint, ConnectionFactory, MqttClient, MqttTuning, ProxyEndpoint, RumqttcConnector,
    TlsMaterial, TransportSettings,
};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Native middleware: resolves the broker through a [`ServiceLocator`] and
/// owns the resulting [`MqttClient`].
pub struct NativeMiddleware {
    pubsub_client: MqttClient,
}

impl NativeMiddleware {
    pub fn new(locator: &dyn ServiceLocator, tuning: MqttTuning) -> Result<Self, ConfigError> {
        Self::with_factory(locator, tuning, Arc::new(RumqttcConnector))
    }

    pub fn with_factory(
        locator: &dyn ServiceLocator,
        tuning: MqttTuning,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, ConfigError> {
        let settings = resolve_transport_settings(locator)?;
        Ok(Self {
            pubsub_client: MqttClient::with_options(settings, tuning, factory),
        })
    }

    pub fn pubsub_client(&self) -> &MqttClient {
        &self.pubsub_client
    }

    pub async fn start(&self) -> PubSubResult<()> {
        self.pubsub_client.init().await
    }

    /// Nothing to wait for: connections come up in the background
    pub async fn wait_until_ready(&self) {}

    pub async fn stop(&self) {
        self.pubsub_client.shutdown().await
    }
}

/// Build transport settings from the `mqtt` and `mqtt_proxy` locations and
/// the certificates registered for `mqtt`.
pub fn resolve_transport_settings(
    locator: &dyn ServiceLocator,
) -> Result<TransportSettings, ConfigError> {
    let address = locator
        .service_location(MQTT_SERVICE)
        .ok_or_else(|| ConfigError::MissingService(MQTT_SERVICE.to_string()))?;
    let broker_url = parse_location(MQTT_SERVICE, &address)?;
    let hostname = broker_url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or(ConfigError::MissingHostname)?;
    let endpoint = BrokerEndpoint::new(hostname, broker_url.port());

    let certificates = locator.certificates(MQTT_SERVICE);
    let tls = TlsMaterial::from_parts(
        certificates.ca_cert,
        certificates.device_cert,
        certificates.key,
    )?;
    if tls.is_some() {
        info!("Using certificates to connect to mqtt broker");
    }

    let proxy = match locator.service_location(MQTT_PROXY_SERVICE) {
        Some(proxy_address) => {
            info!("Using proxy to connect to mqtt broker");
            Some(parse_proxy(&proxy_address)?)
        }
        None => None,
    };

    TransportSettings::new(endpoint, tls, proxy)
}

fn parse_location(service: &str, address: &str) -> Result<Url, ConfigError> {
    Url::parse(address).map_err(|_| ConfigError::InvalidServiceUrl {
        service: service.to_string(),
        url: address.to_string(),
    })
}

fn parse_proxy(address: &str) -> Result<ProxyEndpoint, ConfigError> {
    let proxy_url = parse_location(MQTT_PROXY_SERVICE, address)?;
    let invalid = || ConfigError::InvalidServiceUrl {
        service: MQTT_PROXY_SERVICE.to_string(),
        url: address.to_string(),
    };

    let hostname = proxy_url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(invalid)?;
    let port = proxy_url.port_or_known_default().ok_or_else(invalid)?;
    Ok(ProxyEndpoint::new(hostname, port))
}
