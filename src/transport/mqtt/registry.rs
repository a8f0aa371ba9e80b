//! Topic subscription registry
//!
//! The registry is written from the host scheduler (`subscribe_topic`) and
//! read from the subscriber's background thread (reconnect replay and message
//! dispatch). Readers take an immutable snapshot; writers publish a new
//! snapshot with an RCU swap, so a reader never sees a half-applied insert and
//! never holds a lock while a handler runs.

use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by an asynchronous handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub type SyncHandlerFn = Arc<dyn Fn(String) + Send + Sync>;
pub type AsyncHandlerFn = Arc<dyn Fn(String) -> HandlerFuture + Send + Sync>;

/// Message handler, either invoked in place or scheduled on the host runtime
#[derive(Clone)]
pub enum Handler {
    /// Runs directly on the transport's background thread.
    Sync(SyncHandlerFn),
    /// Produces a future that is spawned on the host runtime.
    Async(AsyncHandlerFn),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::Async(Arc::new(move |message| Box::pin(f(message))))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// A topic filter and the handler it feeds
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    pub topic_pattern: String,
    pub handler: Handler,
}

impl TopicSubscription {
    pub fn new(topic_pattern: impl Into<String>, handler: Handler) -> Self {
        Self {
            topic_pattern: topic_pattern.into(),
            handler,
        }
    }

    /// Whether a concrete topic matches this subscription's filter
    pub fn matches(&self, topic: &str) -> bool {
        rumqttc::mqttbytes::matches(topic, &self.topic_pattern)
    }
}

/// Ordered, append-only collection of subscriptions
///
/// Entries are kept in insertion order; subscribing the same pattern twice
/// keeps both entries.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<ArcSwap<Vec<TopicSubscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscription, returning the number of entries afterwards
    pub fn insert(&self, subscription: TopicSubscription) -> usize {
        let updated = self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(subscription.clone());
            next
        });
        // rcu returns the previous value
        updated.len() + 1
    }

    /// Current entries in insertion order
    pub fn snapshot(&self) -> Arc<Vec<TopicSubscription>> {
        self.entries.load_full()
    }

    /// Subscriptions whose filter matches `topic`, in insertion order
    pub fn matching(&self, topic: &str) -> Vec<TopicSubscription> {
        self.entries
            .load()
            .iter()
            .filter(|subscription| subscription.matches(topic))
            .cloned()
            .collect()
    }

    /// Topic patterns in insertion order
    pub fn topic_patterns(&self) -> Vec<String> {
        self.entries
            .load()
            .iter()
            .map(|subscription| subscription.topic_pattern.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topic_patterns())
            .finish()
    }
}

/// Validate an MQTT topic filter (`+` and `#` wildcards allowed)
pub fn is_valid_topic_filter(filter: &str) -> bool {
    rumqttc::mqttbytes::valid_filter(filter)
}
