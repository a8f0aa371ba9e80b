//! Bridge from the subscriber's background thread to the host runtime
//!
//! [`CallbackBridge::deliver`] runs on the transport thread. Synchronous
//! handlers are called in place; asynchronous handlers are turned into
//! [`ScheduledDelivery`] values and pushed onto an unbounded channel that the
//! [`HostDispatcher`] drains on the host runtime. The channel preserves arrival
//! order, so deliveries for the same topic are scheduled first-in first-out.

use super::message_handler::MessageHandler;
use super::registry::{Handler, HandlerFuture, SubscriptionRegistry};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// An asynchronous handler invocation waiting for the host runtime
pub struct ScheduledDelivery {
    pub topic: String,
    pub topic_pattern: String,
    pub message: String,
    future: HandlerFuture,
}

impl ScheduledDelivery {
    /// Run the handler to completion on the calling runtime
    pub async fn run(self) {
        self.future.await
    }
}

impl std::fmt::Debug for ScheduledDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledDelivery")
            .field("topic", &self.topic)
            .field("topic_pattern", &self.topic_pattern)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Registry entries whose filter matched the topic
    pub matched: usize,
    /// Synchronous handlers invoked in place
    pub invoked: usize,
    /// Asynchronous handlers queued for the host runtime
    pub scheduled: usize,
    /// Payload was dropped because it was not UTF-8
    pub dropped: bool,
}

/// Dispatches inbound messages to the handlers registered for their topic
#[derive(Clone)]
pub struct CallbackBridge {
    registry: SubscriptionRegistry,
    host_tx: mpsc::UnboundedSender<ScheduledDelivery>,
}

impl CallbackBridge {
    /// Create a bridge and the dispatcher that must run on the host runtime
    pub fn new(registry: SubscriptionRegistry) -> (Self, HostDispatcher) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        (Self { registry, host_tx }, HostDispatcher { host_rx })
    }

    /// Deliver one message. Never blocks and never panics on bad input.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) -> DeliveryOutcome {
        let subscriptions = self.registry.matching(topic);
        let mut outcome = DeliveryOutcome {
            matched: subscriptions.len(),
            ..Default::default()
        };

        if subscriptions.is_empty() {
            debug!(target: "mqtt_transport", "No subscription matches topic {}", topic);
            return outcome;
        }

        let message = match MessageHandler::decode_payload(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                error!("{}: {}", e, e.source);
                outcome.dropped = true;
                return outcome;
            }
        };

        for subscription in subscriptions {
            match &subscription.handler {
                Handler::Sync(handler) => {
                    let result = catch_unwind(AssertUnwindSafe(|| handler(message.clone())));
                    if result.is_err() {
                        error!(
                            "Handler for {} panicked while processing {}",
                            subscription.topic_pattern, topic
                        );
                    }
                    outcome.invoked += 1;
                }
                Handler::Async(handler) => {
                    let delivery = ScheduledDelivery {
                        topic: topic.to_string(),
                        topic_pattern: subscription.topic_pattern.clone(),
                        message: message.clone(),
                        future: handler(message.clone()),
                    };
                    if self.host_tx.send(delivery).is_err() {
                        warn!(
                            "Host dispatcher is gone, dropping message for {}",
                            subscription.topic_pattern
                        );
                    } else {
                        outcome.scheduled += 1;
                    }
                }
            }
        }

        outcome
    }
}

/// Host-side end of the bridge
pub struct HostDispatcher {
    host_rx: mpsc::UnboundedReceiver<ScheduledDelivery>,
}

impl HostDispatcher {
    /// Next queued delivery, in arrival order
    pub async fn recv(&mut self) -> Option<ScheduledDelivery> {
        self.host_rx.recv().await
    }

    /// Everything queued right now, without waiting
    pub fn drain_ready(&mut self) -> Vec<ScheduledDelivery> {
        let mut ready = Vec::new();
        while let Ok(delivery) = self.host_rx.try_recv() {
            ready.push(delivery);
        }
        ready
    }

    /// Spawn every delivery as its own task on the current runtime until the
    /// bridge is dropped. Handlers do not wait for each other.
    pub async fn run(mut self) {
        while let Some(delivery) = self.recv().await {
            tokio::spawn(delivery.run());
        }
        debug!(target: "mqtt_transport", "Host dispatcher stopped");
    }
}
