//! Pub/sub bridge
//!
//! A publish/subscribe client facade over MQTT that keeps separate broker
//! connections for publishing and subscribing.
//!
//! # Overview
//!
//! - Transport settings for plain TCP, TLS with client certificates, and TLS
//!   tunnelled through an HTTP CONNECT proxy
//! - A subscription registry that is replayed on every reconnect
//! - Delivery of inbound messages to handlers on the host tokio runtime
//! - Service-location based middleware and TOML configuration
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pubsub_bridge::transport::mqtt::{Handler, MqttClient, TransportSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MqttClient::new(TransportSettings::plaintext("localhost", Some(1883))?);
//! client.init().await?;
//! client.subscribe_topic(
//!     "vehicle/#",
//!     Handler::asynchronous(|message| async move {
//!         tracing::info!("received {message}");
//!     }),
//! )?;
//! client.run()?;
//! client.publish_event("vehicle/status", "online")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, PubSubConfig};
pub use error::{PubSubError, PubSubResult};
pub use middleware::{ConfigServiceLocator, NativeMiddleware, ServiceLocator};
pub use transport::mqtt::{Handler, MqttClient, PublishReceipt, TransportSettings};
pub use transport::PubSubClient;
