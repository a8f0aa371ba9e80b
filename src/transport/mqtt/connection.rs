//! Connection state, tuning and the broker connection seam
//!
//! [`BrokerConnection`] is the narrow surface the manager and facade need from
//! a live connection; [`ConnectionFactory`] opens one. The rumqttc-backed
//! implementations live here, test doubles live in `crate::testing`.

use super::settings::{ConnectionParameters, TlsIdentity};
use rumqttc::{AsyncClient, ClientError, ConnectReturnCode, EventLoop, QoS, SubscribeFilter};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connection state, tracked separately for each role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial state, or after a network fault)
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// ConnAck received, ready for operations
    Connected,
}

/// Which of the two broker connections an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Publisher,
    Subscriber,
}

impl ConnectionRole {
    pub fn short_name(&self) -> &'static str {
        match self {
            ConnectionRole::Publisher => "pub",
            ConnectionRole::Subscriber => "sub",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Publisher => write!(f, "publisher"),
            ConnectionRole::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds (if empty, uses sustained delay)
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Per-connection tuning applied identically to both roles
#[derive(Debug, Clone, PartialEq)]
pub struct MqttTuning {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub request_channel_capacity: usize,
    pub publish_qos: QoS,
    pub subscribe_qos: QoS,
    pub reconnect: ReconnectConfig,
}

impl Default for MqttTuning {
    fn default() -> Self {
        Self {
            client_id_prefix: "pubsub".to_string(),
            keep_alive: Duration::from_secs(60),
            request_channel_capacity: 64,
            publish_qos: QoS::AtMostOnce,
            subscribe_qos: QoS::AtMostOnce,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Subscription to {topic} failed")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Disconnect request failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Failed to open {role} connection: {reason}")]
    OpenFailed {
        role: ConnectionRole,
        reason: String,
    },
}

/// Operations issued against a live broker connection.
///
/// All methods enqueue and return immediately; none of them waits for a
/// broker acknowledgement. They are called both from the host scheduler and
/// from the transport's background thread, so implementations must not block.
pub trait BrokerConnection: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;

    /// Subscribe to several filters with a single request.
    /// An empty slice sends nothing.
    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), MqttError>;

    fn publish(&self, topic: &str, qos: QoS, payload: String) -> Result<(), MqttError>;

    fn disconnect(&self) -> Result<(), MqttError>;
}

impl BrokerConnection for AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.try_subscribe(topic, qos)
            .map_err(|e| MqttError::SubscribeFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), MqttError> {
        if topics.is_empty() {
            return Ok(());
        }
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos));
        self.try_subscribe_many(filters)
            .map_err(|e| MqttError::SubscribeFailed {
                topic: topics.join(", "),
                source: Box::new(e),
            })
    }

    fn publish(&self, topic: &str, qos: QoS, payload: String) -> Result<(), MqttError> {
        self.try_publish(topic, qos, false, payload)
            .map_err(|e| MqttError::PublishFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.try_disconnect()
            .map_err(|e: ClientError| MqttError::DisconnectFailed(Box::new(e)))
    }
}

/// A freshly opened connection: the request handle plus the event loop that
/// must be polled on a background thread. Test doubles have no event loop.
pub struct OpenedConnection {
    pub handle: Arc<dyn BrokerConnection>,
    pub event_loop: Option<EventLoop>,
}

/// Opens broker connections from validated parameters
pub trait ConnectionFactory: Send + Sync {
    fn open(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsIdentity>,
        tuning: &MqttTuning,
    ) -> Result<OpenedConnection, MqttError>;
}

/// Factory producing rumqttc clients
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcConnector;

impl ConnectionFactory for RumqttcConnector {
    fn open(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsIdentity>,
        tuning: &MqttTuning,
    ) -> Result<OpenedConnection, MqttError> {
        if params.security.tls_material().is_some() && tls.is_none() {
            return Err(MqttError::OpenFailed {
                role: params.role,
                reason: "TLS configured but no certificate material loaded".to_string(),
            });
        }

        let mqtt_options = params.mqtt_options(tls, tuning);
        let (client, event_loop) = AsyncClient::new(mqtt_options, tuning.request_channel_capacity);

        Ok(OpenedConnection {
            handle: Arc::new(client),
            event_loop: Some(event_loop),
        })
    }
}
