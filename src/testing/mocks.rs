//! Mock broker connections
//!
//! [`MockConnectionFactory`] hands out one [`MockConnection`] per role and
//! records the parameters each role was opened with. Nothing touches the
//! network; tests drive connect callbacks on the manager directly.

use crate::transport::mqtt::{
    BrokerConnection, ConnectionFactory, ConnectionParameters, ConnectionRole, MqttError,
    MqttTuning, OpenedConnection, TlsIdentity,
};
use rumqttc::QoS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Recording stand-in for a live connection
///
/// With a request capacity set, every subscribe, subscribe-many and publish
/// call takes one slot and calls beyond the capacity fail, like a full
/// request queue that nobody drains.
#[derive(Debug, Default)]
pub struct MockConnection {
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<(String, String)>>,
    disconnects: AtomicUsize,
    requests: AtomicUsize,
    request_capacity: Option<usize>,
    pub should_fail: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn with_request_capacity(capacity: usize) -> Self {
        Self {
            request_capacity: Some(capacity),
            ..Default::default()
        }
    }

    /// Subscribed filters with their QoS, in the order they were issued
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Published (topic, payload) pairs in order
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }

    /// Requests accepted so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        lock(&self.subscriptions).clear();
        lock(&self.published).clear();
    }

    fn refusal(&self) -> Box<dyn std::error::Error + Send + Sync> {
        "mock connection configured to fail".into()
    }

    /// Take a request slot, or explain why none is available
    fn acquire(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.should_fail {
            return Err(self.refusal());
        }
        let taken = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.request_capacity.is_some_and(|capacity| taken >= capacity) {
            self.requests.fetch_sub(1, Ordering::SeqCst);
            return Err("mock request queue full".into());
        }
        Ok(())
    }
}

impl BrokerConnection for MockConnection {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.acquire().map_err(|source| MqttError::SubscribeFailed {
            topic: topic.to_string(),
            source,
        })?;
        lock(&self.subscriptions).push((topic.to_string(), qos));
        Ok(())
    }

    fn subscribe_many(&self, topics: &[String], qos: QoS) -> Result<(), MqttError> {
        if topics.is_empty() {
            return Ok(());
        }
        self.acquire().map_err(|source| MqttError::SubscribeFailed {
            topic: topics.join(", "),
            source,
        })?;
        lock(&self.subscriptions).extend(topics.iter().map(|topic| (topic.clone(), qos)));
        Ok(())
    }

    fn publish(&self, topic: &str, _qos: QoS, payload: String) -> Result<(), MqttError> {
        self.acquire().map_err(|source| MqttError::PublishFailed {
            topic: topic.to_string(),
            source,
        })?;
        lock(&self.published).push((topic.to_string(), payload));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One call to [`ConnectionFactory::open`]
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub parameters: ConnectionParameters,
    pub tls: Option<TlsIdentity>,
}

/// Factory returning shared [`MockConnection`]s
#[derive(Debug, Clone)]
pub struct MockConnectionFactory {
    publisher: Arc<MockConnection>,
    subscriber: Arc<MockConnection>,
    opened: Arc<Mutex<Vec<OpenRecord>>>,
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::from_connections(MockConnection::new(), MockConnection::new())
    }
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both connections reject every subscribe and publish
    pub fn with_failure() -> Self {
        Self::from_connections(MockConnection::with_failure(), MockConnection::with_failure())
    }

    pub fn from_connections(publisher: MockConnection, subscriber: MockConnection) -> Self {
        Self {
            publisher: Arc::new(publisher),
            subscriber: Arc::new(subscriber),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publisher(&self) -> Arc<MockConnection> {
        Arc::clone(&self.publisher)
    }

    pub fn subscriber(&self) -> Arc<MockConnection> {
        Arc::clone(&self.subscriber)
    }

    /// Every open call, in order
    pub fn opened(&self) -> Vec<OpenRecord> {
        lock(&self.opened).clone()
    }

    /// Parameters the given role was last opened with
    pub fn opened_for(&self, role: ConnectionRole) -> Option<OpenRecord> {
        lock(&self.opened)
            .iter()
            .rev()
            .find(|record| record.parameters.role == role)
            .cloned()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn open(
        &self,
        params: &ConnectionParameters,
        tls: Option<&TlsIdentity>,
        _tuning: &MqttTuning,
    ) -> Result<OpenedConnection, MqttError> {
        lock(&self.opened).push(OpenRecord {
            parameters: params.clone(),
            tls: tls.cloned(),
        });

        let handle: Arc<dyn BrokerConnection> = match params.role {
            ConnectionRole::Publisher => self.publisher(),
            ConnectionRole::Subscriber => self.subscriber(),
        };
        Ok(OpenedConnection {
            handle,
            event_loop: None,
        })
    }
}
