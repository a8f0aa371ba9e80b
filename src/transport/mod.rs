//! Transport layer for pub/sub messaging
//!
//! This module provides the client abstraction used by middleware consumers
//! and its MQTT implementation.

use crate::error::PubSubResult;
use crate::transport::mqtt::{Handler, PublishReceipt};

pub mod mqtt;

/// Publish/subscribe client
///
/// Only `init` suspends. `subscribe_topic` and `publish_event` enqueue work
/// and return without waiting for the broker.
#[async_trait::async_trait]
pub trait PubSubClient: Send + Sync {
    /// Open the broker connections
    async fn init(&self) -> PubSubResult<()>;

    /// Start background processing
    fn run(&self) -> PubSubResult<()>;

    /// Register a handler for a topic filter
    fn subscribe_topic(&self, topic: &str, handler: Handler) -> PubSubResult<()>;

    /// Publish a text payload
    fn publish_event(&self, topic: &str, payload: &str) -> PubSubResult<PublishReceipt>;
}
