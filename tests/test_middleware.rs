//! Native middleware tests
//!
//! The middleware resolves the broker through a service locator and owns
//! the client. A static locator stands in for the real lookup.

use pubsub_bridge::config::{ConfigError, PubSubConfig};
use pubsub_bridge::middleware::{
    ConfigServiceLocator, NativeMiddleware, ServiceCertificates, ServiceLocator,
};
use pubsub_bridge::testing::MockConnectionFactory;
use pubsub_bridge::transport::mqtt::{ConnectionRole, MqttTuning, ProxyEndpoint};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct StaticLocator {
    locations: HashMap<&'static str, String>,
    certificates: ServiceCertificates,
}

impl ServiceLocator for StaticLocator {
    fn service_location(&self, service_name: &str) -> Option<String> {
        self.locations.get(service_name).cloned()
    }

    fn certificates(&self, _service_name: &str) -> ServiceCertificates {
        self.certificates.clone()
    }
}

fn write_certificates(dir: &TempDir) -> ServiceCertificates {
    let path = |name: &str| -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("pem for {name}")).unwrap();
        path
    };
    ServiceCertificates {
        ca_cert: Some(path("ca.pem")),
        key: Some(path("device.key")),
        device_cert: Some(path("device.pem")),
    }
}

#[tokio::test]
async fn test_start_initialises_client_from_locator() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let locator = StaticLocator {
        locations: HashMap::from([
            ("mqtt", "mqtts://broker.example:8883".to_string()),
            ("mqtt_proxy", "http://proxy.local:8080".to_string()),
        ]),
        certificates: write_certificates(&dir),
    };
    let factory = MockConnectionFactory::new();
    let middleware =
        NativeMiddleware::with_factory(&locator, MqttTuning::default(), Arc::new(factory.clone()))
            .unwrap();

    // Act
    middleware.start().await.unwrap();
    middleware.wait_until_ready().await;

    // Assert
    assert!(middleware.pubsub_client().is_initialized());
    for role in [ConnectionRole::Publisher, ConnectionRole::Subscriber] {
        let record = factory.opened_for(role).unwrap();
        assert_eq!(record.parameters.host, "broker.example");
        assert_eq!(record.parameters.port, 8883);
        assert_eq!(
            record.parameters.security.proxy(),
            Some(&ProxyEndpoint::new("proxy.local", 8080))
        );
        assert_eq!(record.tls.unwrap().client_key, b"pem for device.key");
    }

    middleware.stop().await;
    assert_eq!(factory.publisher().disconnect_count(), 1);
}

#[test]
fn test_missing_hostname_is_fatal() {
    let locator = StaticLocator {
        locations: HashMap::from([("mqtt", "mqtt:".to_string())]),
        certificates: ServiceCertificates::default(),
    };

    let result = NativeMiddleware::new(&locator, MqttTuning::default());
    assert!(matches!(result, Err(ConfigError::MissingHostname)));
}

#[tokio::test]
async fn test_config_backed_locator_publishes() {
    let config = PubSubConfig::from_toml_str(
        r#"
[services]
mqtt = "mqtt://localhost:1884"

[mqtt]
publish_qos = 1
"#,
    )
    .unwrap();
    let locator = ConfigServiceLocator::from_config(&config);
    let factory = MockConnectionFactory::new();
    let middleware =
        NativeMiddleware::with_factory(&locator, config.tuning().unwrap(), Arc::new(factory.clone()))
            .unwrap();

    middleware.start().await.unwrap();
    let receipt = middleware
        .pubsub_client()
        .publish_event("vehicle/status", "ready")
        .unwrap();

    assert_eq!(receipt.qos, rumqttc::QoS::AtLeastOnce);
    assert_eq!(
        factory.opened_for(ConnectionRole::Publisher).unwrap().parameters.port,
        1884
    );
    assert_eq!(
        factory.publisher().published(),
        vec![("vehicle/status".to_string(), "ready".to_string())]
    );
}
