//! Dual connection manager
//!
//! Owns the publisher and subscriber connections, their states, and the
//! background threads that poll them. Each connection gets a dedicated OS
//! thread running a current-thread tokio runtime, so broker I/O and
//! synchronous handlers never run on the host scheduler.

use super::bridge::{CallbackBridge, DeliveryOutcome};
use super::connection::{
    BrokerConnection, ConnectionFactory, ConnectionRole, ConnectionState, MqttTuning,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::registry::SubscriptionRegistry;
use super::settings::{TlsIdentity, TransportSettings};
use crate::error::{PubSubError, PubSubResult};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Filter bytes per replayed SUBSCRIBE, well under rumqttc's default
/// 10 KiB packet limit
const REPLAY_BATCH_BYTES: usize = 4096;

/// Longest wait for the DISCONNECT packet to leave on shutdown
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether the background loop keeps polling after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// One connection and its state
struct ConnectionSlot {
    role: ConnectionRole,
    handle: OnceLock<Arc<dyn BrokerConnection>>,
    event_loop: Mutex<Option<EventLoop>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionSlot {
    fn new(role: ConnectionRole) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            handle: OnceLock::new(),
            event_loop: Mutex::new(None),
            state_tx,
        }
    }

    fn handle(&self) -> Option<&Arc<dyn BrokerConnection>> {
        self.handle.get()
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(target: "mqtt_transport", "{} connection: {:?} -> {:?}", self.role, previous, state);
        }
    }

    fn take_event_loop(&self) -> Option<EventLoop> {
        self.event_loop
            .lock()
            .ok()
            .and_then(|mut event_loop| event_loop.take())
    }
}

/// Owner of the publisher and subscriber broker connections
pub struct DualConnectionManager {
    publisher: ConnectionSlot,
    subscriber: ConnectionSlot,
    registry: SubscriptionRegistry,
    bridge: CallbackBridge,
    tuning: MqttTuning,
    running: AtomicBool,
    disconnect_requested: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DualConnectionManager {
    pub fn new(registry: SubscriptionRegistry, bridge: CallbackBridge, tuning: MqttTuning) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            publisher: ConnectionSlot::new(ConnectionRole::Publisher),
            subscriber: ConnectionSlot::new(ConnectionRole::Subscriber),
            registry,
            bridge,
            tuning,
            running: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            shutdown_tx,
            threads: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, role: ConnectionRole) -> &ConnectionSlot {
        match role {
            ConnectionRole::Publisher => &self.publisher,
            ConnectionRole::Subscriber => &self.subscriber,
        }
    }

    pub fn tuning(&self) -> &MqttTuning {
        &self.tuning
    }

    /// Open both connections with identical transport settings.
    ///
    /// Nothing is sent to the broker until [`run`](Self::run) starts the
    /// background loops; state is `Connecting` from here on.
    pub fn connect(
        &self,
        settings: &TransportSettings,
        tls: Option<&TlsIdentity>,
        factory: &dyn ConnectionFactory,
    ) -> PubSubResult<()> {
        if self.is_initialized() {
            return Err(PubSubError::AlreadyInitialized);
        }

        // Open both before committing either, so a failed open can be retried
        let mut opened = Vec::with_capacity(2);
        for role in [ConnectionRole::Subscriber, ConnectionRole::Publisher] {
            let params = settings.connection_parameters(role, &self.tuning.client_id_prefix);
            info!(
                client_id = %params.client_id,
                "Opening {} connection to {}:{}",
                role, params.host, params.port
            );
            opened.push((role, factory.open(&params, tls, &self.tuning)?));
        }

        for (role, connection) in opened {
            let slot = self.slot(role);
            if slot.handle.set(connection.handle).is_err() {
                return Err(PubSubError::AlreadyInitialized);
            }
            if let Ok(mut event_loop) = slot.event_loop.lock() {
                *event_loop = connection.event_loop;
            }
            slot.set_state(ConnectionState::Connecting);
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.publisher.handle().is_some() && self.subscriber.handle().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self, role: ConnectionRole) -> ConnectionState {
        self.slot(role).state()
    }

    pub fn watch_state(&self, role: ConnectionRole) -> watch::Receiver<ConnectionState> {
        self.slot(role).state_tx.subscribe()
    }

    /// Start the background network loops. Returns immediately.
    pub fn run(self: &Arc<Self>) -> PubSubResult<()> {
        if !self.is_initialized() {
            return Err(PubSubError::NotInitialized);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PubSubError::AlreadyRunning);
        }

        for role in [ConnectionRole::Subscriber, ConnectionRole::Publisher] {
            let Some(event_loop) = self.slot(role).take_event_loop() else {
                debug!(target: "mqtt_transport", "No event loop to drive for {} connection", role);
                continue;
            };

            let manager = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = std::thread::Builder::new()
                .name(format!("mqtt-{}", role.short_name()))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("Failed to build runtime for {} connection: {}", role, e);
                            return;
                        }
                    };
                    let span = crate::mqtt_span!(role = %role);
                    runtime.block_on(
                        manager
                            .drive_event_loop(role, event_loop, shutdown_rx)
                            .instrument(span),
                    );
                })
                .map_err(PubSubError::Runtime)?;

            if let Ok(mut threads) = self.threads.lock() {
                threads.push(handle);
            }
        }

        Ok(())
    }

    /// Poll one connection's event loop until shutdown.
    ///
    /// rumqttc reconnects on the next `poll` after an error; this loop only
    /// spaces those attempts out using the reconnect backoff.
    async fn drive_event_loop(
        &self,
        role: ConnectionRole,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting {} event loop", role);
        let mut failures = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping {} event loop", role);
                        break;
                    }
                }

                polled = event_loop.poll() => {
                    let route = match &polled {
                        Ok(event) => MessageHandler::route_mqtt_event(event),
                        Err(e) => MessageHandler::route_connection_error(e),
                    };
                    let acknowledged = matches!(
                        route,
                        EventRoute::ConnectionAcknowledged { code: ConnectReturnCode::Success, .. }
                    );

                    if self.handle_route(role, route) == LoopControl::Stop {
                        break;
                    }

                    if acknowledged {
                        failures = 0;
                    } else if polled.is_err() {
                        failures += 1;
                        if !self.tuning.reconnect.allows_attempt(failures) {
                            error!("Giving up on {} connection after {} attempts", role, failures);
                            break;
                        }

                        let delay_ms = self.tuning.reconnect.calculate_backoff_delay(failures);
                        info!("Reconnecting {} connection in {}ms (attempt {})", role, delay_ms, failures);
                        if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                            break;
                        }
                        self.slot(role).set_state(ConnectionState::Connecting);
                    }
                }
            }
        }

        if self.disconnect_requested.load(Ordering::SeqCst)
            && self.slot(role).state() == ConnectionState::Connected
        {
            if flush_disconnect(&mut event_loop, DISCONNECT_FLUSH_TIMEOUT).await {
                debug!("{} DISCONNECT sent to broker", role);
            } else {
                warn!("{} DISCONNECT not confirmed before shutdown", role);
            }
        }

        self.slot(role).set_state(ConnectionState::Disconnected);
        info!("{} event loop stopped", role);
    }

    /// Act on a routed event for `role`
    pub fn handle_route(&self, role: ConnectionRole, route: EventRoute) -> LoopControl {
        match route {
            EventRoute::ConnectionAcknowledged { code, .. } | EventRoute::ConnectionRefused(code) => {
                self.on_connect(role, code);
            }
            EventRoute::MessageReceived { topic, payload } => {
                if role == ConnectionRole::Subscriber {
                    self.on_message(&topic, payload);
                } else {
                    debug!(target: "mqtt_transport", "Ignoring message on publisher connection: {}", topic);
                }
            }
            EventRoute::Disconnected { reason } => self.on_disconnect(role, &reason),
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if failed > 0 {
                    warn!("Broker rejected {} filter(s) in subscription {}", failed, packet_id);
                } else {
                    debug!(target: "mqtt_transport", "Subscription {} confirmed", packet_id);
                }
            }
            EventRoute::RequestsDone => {
                info!("All {} request handles dropped", role);
                return LoopControl::Stop;
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
        LoopControl::Continue
    }

    fn on_connect(&self, role: ConnectionRole, code: ConnectReturnCode) {
        match role {
            ConnectionRole::Subscriber => self.on_connect_subscriber(code),
            ConnectionRole::Publisher => self.on_connect_publisher(code),
        }
    }

    fn on_disconnect(&self, role: ConnectionRole, reason: &str) {
        match role {
            ConnectionRole::Subscriber => self.on_disconnect_subscriber(reason),
            ConnectionRole::Publisher => self.on_disconnect_publisher(reason),
        }
    }

    /// Subscriber connect result. On success every registered topic is
    /// subscribed again, in registration order.
    pub fn on_connect_subscriber(&self, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            error!("Bad connection request on subscriber, return code: {:?}", code);
            self.subscriber.set_state(ConnectionState::Disconnected);
            return;
        }

        debug!("Subscriber connection OK");
        // State before snapshot: a concurrent subscribe_topic either lands in
        // the snapshot or observes Connected and subscribes itself.
        self.subscriber.set_state(ConnectionState::Connected);

        let Some(handle) = self.subscriber.handle() else {
            warn!("Subscriber connected without a connection handle");
            return;
        };

        let topics: Vec<String> = self
            .registry
            .snapshot()
            .iter()
            .map(|subscription| subscription.topic_pattern.clone())
            .collect();

        // Batched so a large registry takes few slots in the request queue
        for batch in replay_batches(&topics, REPLAY_BATCH_BYTES) {
            match handle.subscribe_many(batch, self.tuning.subscribe_qos) {
                Ok(()) => {
                    debug!(target: "mqtt_transport", "Re-subscribed to {} topic(s)", batch.len())
                }
                Err(e) => error!("Failed to re-subscribe to {}: {}", batch.join(", "), e),
            }
        }
    }

    /// Subscriber lost its connection; subscriptions come back on the next
    /// successful connect.
    pub fn on_disconnect_subscriber(&self, reason: &str) {
        debug!("Subscriber disconnected with reason: {}", reason);
        self.subscriber.set_state(ConnectionState::Disconnected);
    }

    pub fn on_connect_publisher(&self, code: ConnectReturnCode) {
        if code == ConnectReturnCode::Success {
            debug!("Publisher connection OK");
            self.publisher.set_state(ConnectionState::Connected);
        } else {
            error!("Bad connection request on publisher, return code: {:?}", code);
            self.publisher.set_state(ConnectionState::Disconnected);
        }
    }

    pub fn on_disconnect_publisher(&self, reason: &str) {
        debug!("Publisher disconnected with reason: {}", reason);
        self.publisher.set_state(ConnectionState::Disconnected);
    }

    /// Message received on the subscriber connection
    pub fn on_message(&self, topic: &str, payload: Vec<u8>) -> DeliveryOutcome {
        self.bridge.deliver(topic, payload)
    }

    /// Issue a live subscribe if the subscriber is connected.
    /// Returns whether a subscribe request was sent.
    pub fn subscribe_if_connected(&self, topic: &str) -> PubSubResult<bool> {
        if self.subscriber.state() != ConnectionState::Connected {
            return Ok(false);
        }
        let handle = self.subscriber.handle().ok_or(PubSubError::NotInitialized)?;
        handle.subscribe(topic, self.tuning.subscribe_qos)?;
        Ok(true)
    }

    /// Publish text on the publisher connection
    pub fn publish(&self, topic: &str, payload: String) -> PubSubResult<()> {
        let handle = self.publisher.handle().ok_or(PubSubError::NotInitialized)?;
        handle
            .publish(topic, self.tuning.publish_qos, payload)
            .map_err(|source| PubSubError::PublishFailed {
                topic: topic.to_string(),
                source,
            })
    }

    /// Ask the broker to close both connections and stop the background
    /// loops. Returns the thread handles so the caller can join them.
    pub fn begin_shutdown(&self) -> Vec<JoinHandle<()>> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        for slot in [&self.subscriber, &self.publisher] {
            if let Some(handle) = slot.handle() {
                if let Err(e) = handle.disconnect() {
                    debug!("{} disconnect request not sent: {}", slot.role, e);
                }
            }
        }
        self.signal_shutdown();

        self.threads
            .lock()
            .map(|mut threads| std::mem::take(&mut *threads))
            .unwrap_or_default()
    }

    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Source of broker events for one connection
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<Event, ConnectionError>;
}

#[async_trait::async_trait]
impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }
}

/// Keep polling until the queued DISCONNECT has been written.
/// Returns false on error or when `limit` elapses first.
pub async fn flush_disconnect(source: &mut dyn EventSource, limit: Duration) -> bool {
    let flushed = tokio::time::timeout(limit, async {
        loop {
            match source.next_event().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    flushed.unwrap_or(false)
}

/// Split topics into groups whose encoded filters stay under `max_bytes`.
/// A topic longer than the limit gets a group of its own.
pub fn replay_batches(topics: &[String], max_bytes: usize) -> Vec<&[String]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for (index, topic) in topics.iter().enumerate() {
        // length prefix + filter + options byte
        let encoded = topic.len() + 3;
        if index > start && size + encoded > max_bytes {
            batches.push(&topics[start..index]);
            start = index;
            size = 0;
        }
        size += encoded;
    }
    if start < topics.len() {
        batches.push(&topics[start..]);
    }
    batches
}

/// Sleep for `delay_ms` unless shutdown is requested first.
/// Returns true if the sleep completed.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
