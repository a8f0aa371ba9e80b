//! Subscription registry replay tests
//!
//! Subscriptions registered before the subscriber connects are issued during
//! the connect callback; later ones are issued immediately. Every reconnect
//! replays the whole registry in registration order.

use proptest::prelude::*;
use pubsub_bridge::testing::{MockConnection, MockConnectionFactory};
use pubsub_bridge::transport::mqtt::{
    ConnectionRole, ConnectionState, Handler, MqttClient, TransportSettings,
};
use pubsub_bridge::PubSubError;
use rumqttc::ConnectReturnCode;
use std::sync::Arc;

fn client_with(factory: &MockConnectionFactory) -> MqttClient {
    let settings = TransportSettings::plaintext("broker.example", None).unwrap();
    MqttClient::with_factory(settings, Arc::new(factory.clone()))
}

fn noop() -> Handler {
    Handler::sync(|_| {})
}

#[tokio::test]
async fn test_subscription_before_connect_replayed_once() {
    // Arrange
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("t1", noop()).unwrap();
    assert!(factory.subscriber().subscribed_topics().is_empty());

    // Act
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    // Assert
    assert_eq!(factory.subscriber().subscribed_topics(), vec!["t1"]);
    assert!(factory.publisher().subscribed_topics().is_empty());
    assert_eq!(
        client.connection_state(ConnectionRole::Subscriber),
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_subscription_after_connect_is_immediate() {
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("t1", noop()).unwrap();
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    client.subscribe_topic("t2", noop()).unwrap();

    assert_eq!(factory.subscriber().subscribed_topics(), vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_wildcard_subscription_end_to_end() {
    // Arrange
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("sensors/+", noop()).unwrap();

    // Act
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    // Assert
    let subscriptions = factory.subscriber().subscribed_topics();
    assert_eq!(
        subscriptions
            .iter()
            .filter(|topic| topic.as_str() == "sensors/+")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_reconnect_replays_full_registry() {
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("a", noop()).unwrap();
    client.subscribe_topic("b/#", noop()).unwrap();

    let manager = client.manager();
    manager.on_connect_subscriber(ConnectReturnCode::Success);
    manager.on_disconnect_subscriber("keep alive timeout");
    assert_eq!(
        client.connection_state(ConnectionRole::Subscriber),
        ConnectionState::Disconnected
    );

    // Registered while disconnected: only picked up by the next replay
    client.subscribe_topic("c", noop()).unwrap();
    factory.subscriber().clear_history();

    manager.on_connect_subscriber(ConnectReturnCode::Success);
    assert_eq!(factory.subscriber().subscribed_topics(), vec!["a", "b/#", "c"]);
}

#[tokio::test]
async fn test_refused_connect_issues_no_subscribes() {
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("t1", noop()).unwrap();

    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::NotAuthorized);

    assert!(factory.subscriber().subscribed_topics().is_empty());
    assert_eq!(
        client.connection_state(ConnectionRole::Subscriber),
        ConnectionState::Disconnected
    );

    // A later successful connect still replays
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);
    assert_eq!(factory.subscriber().subscribed_topics(), vec!["t1"]);
}

#[tokio::test]
async fn test_duplicate_patterns_each_subscribe() {
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);
    client.init().await.unwrap();
    client.subscribe_topic("sensors/+", noop()).unwrap();
    client.subscribe_topic("sensors/+", noop()).unwrap();

    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    assert_eq!(
        factory.subscriber().subscribed_topics(),
        vec!["sensors/+", "sensors/+"]
    );
    assert_eq!(client.registry().len(), 2);
}

#[tokio::test]
async fn test_live_subscribe_failure_keeps_registration() {
    let factory =
        MockConnectionFactory::from_connections(MockConnection::new(), MockConnection::with_failure());
    let client = client_with(&factory);
    client.init().await.unwrap();
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    let result = client.subscribe_topic("t1", noop());

    assert!(matches!(result, Err(PubSubError::Transport(_))));
    assert_eq!(client.registry().topic_patterns(), vec!["t1"]);
}

#[tokio::test]
async fn test_subscribe_before_init_is_registered() {
    let factory = MockConnectionFactory::new();
    let client = client_with(&factory);

    client.subscribe_topic("early/topic", noop()).unwrap();
    client.init().await.unwrap();
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    assert_eq!(factory.subscriber().subscribed_topics(), vec!["early/topic"]);
}

#[tokio::test]
async fn test_replay_beyond_request_queue_capacity() {
    // Arrange
    let factory = MockConnectionFactory::from_connections(
        MockConnection::new(),
        MockConnection::with_request_capacity(64),
    );
    let client = client_with(&factory);
    client.init().await.unwrap();
    let topics: Vec<String> = (0..200).map(|i| format!("plant/line-{i}/+")).collect();
    for topic in &topics {
        client.subscribe_topic(topic, noop()).unwrap();
    }

    // Act
    client
        .manager()
        .on_connect_subscriber(ConnectReturnCode::Success);

    // Assert
    assert_eq!(factory.subscriber().subscribed_topics(), topics);
    assert!(factory.subscriber().request_count() < 64);
}

fn topic_filter() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(/[a-z]{1,8}){0,2}(/\\+|/#)?"
}

proptest! {
    #[test]
    fn test_replay_preserves_registration_order(
        topics in prop::collection::vec(topic_filter(), 1..20)
    ) {
        let factory = MockConnectionFactory::new();
        let client = client_with(&factory);
        tokio_test::block_on(client.init()).unwrap();

        for topic in &topics {
            client.subscribe_topic(topic, noop()).unwrap();
        }
        client.manager().on_connect_subscriber(ConnectReturnCode::Success);

        prop_assert_eq!(factory.subscriber().subscribed_topics(), topics.clone());
        prop_assert_eq!(client.registry().topic_patterns(), topics);
    }
}
