//! Dual-connection MQTT client
//!
//! The client keeps one broker connection for publishing and one for
//! subscribing so that neither direction is blocked behind the other.
//!
//! # Architecture
//!
//! - [`settings`] - Validated transport settings shared by both connections
//! - [`connection`] - Connection state, tuning and the broker connection seam
//! - [`registry`] - Topic subscriptions that survive reconnects
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`bridge`] - Hand-off from the transport thread to the host runtime
//! - [`manager`] - Background loops, connect callbacks and reconnect replay
//! - [`client`] - The public facade
//!
//! # Usage
//!
//! ```rust,no_run
//! use pubsub_bridge::transport::mqtt::{Handler, MqttClient, TransportSettings};
//!
//! # tokio_test::block_on(async {
//! let settings = TransportSettings::plaintext("localhost", None)?;
//! let client = MqttClient::new(settings);
//! client.init().await?;
//! client.subscribe_topic("sensors/+", Handler::sync(|message| println!("{message}")))?;
//! client.run()?;
//! client.publish_event("sensors/speed", "42")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod bridge;
pub mod client;
pub mod connection;
pub mod manager;
pub mod message_handler;
pub mod registry;
pub mod settings;

pub use bridge::{CallbackBridge, DeliveryOutcome, HostDispatcher, ScheduledDelivery};
pub use client::{MqttClient, PublishReceipt};
pub use connection::{
    BrokerConnection, ConnectionFactory, ConnectionRole, ConnectionState, MqttError, MqttTuning,
    OpenedConnection, ReconnectConfig, RumqttcConnector,
};
pub use manager::{
    flush_disconnect, replay_batches, DualConnectionManager, EventSource, LoopControl,
};
pub use message_handler::{DecodeError, EventRoute, MessageHandler};
pub use registry::{is_valid_topic_filter, Handler, SubscriptionRegistry, TopicSubscription};
pub use settings::{
    BrokerEndpoint, ConnectionParameters, ProxyEndpoint, TlsIdentity, TlsMaterial,
    TransportSecurity, TransportSettings, DEFAULT_PLAIN_PORT, DEFAULT_TLS_PORT,
};

pub use rumqttc::QoS;
