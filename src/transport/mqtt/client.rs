//! Pub/sub facade over the dual connection manager

use super::bridge::{CallbackBridge, HostDispatcher};
use super::connection::{
    ConnectionFactory, ConnectionRole, ConnectionState, MqttTuning, RumqttcConnector,
};
use super::manager::DualConnectionManager;
use super::registry::{is_valid_topic_filter, Handler, SubscriptionRegistry, TopicSubscription};
use super::settings::TransportSettings;
use crate::error::{PubSubError, PubSubResult};
use crate::transport::PubSubClient;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Acknowledgement of a queued publish.
///
/// At QoS 0 this only confirms the request entered the transport queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub qos: QoS,
}

/// MQTT pub/sub client with separate publisher and subscriber connections
pub struct MqttClient {
    settings: TransportSettings,
    factory: Arc<dyn ConnectionFactory>,
    registry: SubscriptionRegistry,
    manager: Arc<DualConnectionManager>,
    dispatcher: Mutex<Option<HostDispatcher>>,
    host: OnceLock<Handle>,
}

impl MqttClient {
    pub fn new(settings: TransportSettings) -> Self {
        Self::with_factory(settings, Arc::new(RumqttcConnector))
    }

    pub fn with_factory(settings: TransportSettings, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_options(settings, MqttTuning::default(), factory)
    }

    pub fn with_options(
        settings: TransportSettings,
        tuning: MqttTuning,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let registry = SubscriptionRegistry::new();
        let (bridge, dispatcher) = CallbackBridge::new(registry.clone());
        let manager = Arc::new(DualConnectionManager::new(registry.clone(), bridge, tuning));

        Self {
            settings,
            factory,
            registry,
            manager,
            dispatcher: Mutex::new(Some(dispatcher)),
            host: OnceLock::new(),
        }
    }

    /// Load certificate material and open both connections.
    ///
    /// Must be called from inside the host tokio runtime; asynchronous
    /// handlers are scheduled on it.
    pub async fn init(&self) -> PubSubResult<()> {
        if self.manager.is_initialized() {
            return Err(PubSubError::AlreadyInitialized);
        }
        let host = Handle::try_current().map_err(|_| PubSubError::NoHostRuntime)?;

        let tls = match self.settings.security().tls_material() {
            Some(material) => {
                info!(
                    "Using certificates: ca={}, cert={}",
                    material.ca_cert_path.display(),
                    material.client_cert_path.display()
                );
                Some(material.load().await?)
            }
            None => None,
        };

        self.manager
            .connect(&self.settings, tls.as_ref(), self.factory.as_ref())?;
        let _ = self.host.set(host);

        info!(
            "MQTT client initialised for {}:{}",
            self.settings.endpoint().hostname,
            self.settings.effective_port()
        );
        Ok(())
    }

    /// Start background processing. Returns immediately.
    pub fn run(&self) -> PubSubResult<()> {
        let host = self.host.get().ok_or(PubSubError::NotInitialized)?;
        self.manager.run()?;

        let dispatcher = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut dispatcher| dispatcher.take());
        if let Some(dispatcher) = dispatcher {
            host.spawn(dispatcher.run());
        }

        debug!("MQTT background processing started");
        Ok(())
    }

    /// Register `handler` for `topic`. If the subscriber is already
    /// connected the broker subscription is requested immediately; otherwise
    /// it is issued on the next successful connect.
    pub fn subscribe_topic(&self, topic: &str, handler: Handler) -> PubSubResult<()> {
        if !is_valid_topic_filter(topic) {
            return Err(PubSubError::InvalidTopicFilter(topic.to_string()));
        }

        // Append before checking state; see on_connect_subscriber.
        let count = self
            .registry
            .insert(TopicSubscription::new(topic, handler));
        debug!("Registered subscription {} ({} total)", topic, count);

        if self.manager.subscribe_if_connected(topic)? {
            debug!("Subscribed to {} on live connection", topic);
        }
        Ok(())
    }

    /// Publish a text payload on the publisher connection
    pub fn publish_event(&self, topic: &str, payload: &str) -> PubSubResult<PublishReceipt> {
        self.manager.publish(topic, payload.to_string())?;
        Ok(PublishReceipt {
            topic: topic.to_string(),
            qos: self.manager.tuning().publish_qos,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.manager.is_initialized()
    }

    pub fn connection_state(&self, role: ConnectionRole) -> ConnectionState {
        self.manager.connection_state(role)
    }

    pub fn watch_state(&self, role: ConnectionRole) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state(role)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<DualConnectionManager> {
        &self.manager
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Disconnect both connections and wait up to two seconds for the
    /// background threads to finish.
    pub async fn shutdown(&self) {
        let threads = self.manager.begin_shutdown();
        if threads.is_empty() {
            info!("MQTT client shut down");
            return;
        }

        let join = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        });

        match tokio::time::timeout(Duration::from_secs(2), join).await {
            Ok(Ok(())) => info!("MQTT background threads shut down gracefully"),
            Ok(Err(e)) => warn!("Joining MQTT background threads failed: {}", e),
            Err(_) => warn!("MQTT background threads didn't shut down within 2s"),
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Threads exit on their own; no async disconnect is possible here
        self.manager.signal_shutdown();
    }
}

#[async_trait::async_trait]
impl PubSubClient for MqttClient {
    async fn init(&self) -> PubSubResult<()> {
        MqttClient::init(self).await
    }

    fn run(&self) -> PubSubResult<()> {
        MqttClient::run(self)
    }

    fn subscribe_topic(&self, topic: &str, handler: Handler) -> PubSubResult<()> {
        MqttClient::subscribe_topic(self, topic, handler)
    }

    fn publish_event(&self, topic: &str, payload: &str) -> PubSubResult<PublishReceipt> {
        MqttClient::publish_event(self, topic, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnectionFactory;
    use rumqttc::ConnectReturnCode;

    fn client() -> (MqttClient, MockConnectionFactory) {
        let factory = MockConnectionFactory::new();
        let settings = TransportSettings::plaintext("broker.example", None).unwrap();
        (
            MqttClient::with_factory(settings, Arc::new(factory.clone())),
            factory,
        )
    }

    #[tokio::test]
    async fn test_publish_before_init_rejected() {
        let (client, _factory) = client();
        assert!(matches!(
            client.publish_event("status", "up"),
            Err(PubSubError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_run_before_init_rejected() {
        let (client, _factory) = client();
        assert!(matches!(client.run(), Err(PubSubError::NotInitialized)));
    }

    #[test]
    fn test_init_outside_runtime_rejected() {
        let (client, factory) = client();

        let result = futures::executor::block_on(client.init());

        assert!(matches!(result, Err(PubSubError::NoHostRuntime)));
        assert!(!client.is_initialized());
        assert!(factory.opened().is_empty());
    }

    #[tokio::test]
    async fn test_init_twice_rejected() {
        let (client, _factory) = client();
        client.init().await.unwrap();
        assert!(matches!(
            client.init().await,
            Err(PubSubError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_publish_after_init_returns_receipt() {
        let (client, factory) = client();
        client.init().await.unwrap();

        let receipt = client.publish_event("vehicle/speed", "42").unwrap();
        assert_eq!(receipt.topic, "vehicle/speed");
        assert_eq!(receipt.qos, QoS::AtMostOnce);
        assert_eq!(
            factory.publisher().published(),
            vec![("vehicle/speed".to_string(), "42".to_string())]
        );
        assert!(factory.subscriber().published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces() {
        let factory = MockConnectionFactory::with_failure();
        let settings = TransportSettings::plaintext("broker.example", None).unwrap();
        let client = MqttClient::with_factory(settings, Arc::new(factory));
        client.init().await.unwrap();

        assert!(matches!(
            client.publish_event("status", "up"),
            Err(PubSubError::PublishFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_topic_filter_rejected() {
        let (client, _factory) = client();
        assert!(matches!(
            client.subscribe_topic("a/#/b", Handler::sync(|_| {})),
            Err(PubSubError::InvalidTopicFilter(_))
        ));
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_deferred() {
        let (client, factory) = client();
        client.init().await.unwrap();
        client
            .subscribe_topic("t1", Handler::sync(|_| {}))
            .unwrap();

        assert!(factory.subscriber().subscribed_topics().is_empty());

        client
            .manager()
            .on_connect_subscriber(ConnectReturnCode::Success);
        assert_eq!(factory.subscriber().subscribed_topics(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_state_starts_disconnected() {
        let (client, _factory) = client();
        assert!(!client.is_initialized());
        assert_eq!(
            client.connection_state(ConnectionRole::Publisher),
            ConnectionState::Disconnected
        );

        client.init().await.unwrap();
        let state = client.watch_state(ConnectionRole::Subscriber);
        assert_eq!(*state.borrow(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (client, factory) = client();
        client.init().await.unwrap();
        client.run().unwrap();
        client.shutdown().await;

        assert_eq!(factory.publisher().disconnect_count(), 1);
        assert_eq!(factory.subscriber().disconnect_count(), 1);
    }
}
