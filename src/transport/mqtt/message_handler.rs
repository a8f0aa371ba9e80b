//! Pure routing of rumqttc events and errors
//!
//! The background loop hands every [`Event`] and [`ConnectionError`] to the
//! functions here and acts on the resulting [`EventRoute`].

use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet};
use tracing::debug;

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the appropriate callback
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    code: connack.code,
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect => EventRoute::Disconnected {
                    reason: "Broker sent DISCONNECT".to_string(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, rumqttc::SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Route an event loop error
    pub fn route_connection_error(error: &ConnectionError) -> EventRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => EventRoute::ConnectionRefused(*code),
            ConnectionError::RequestsDone => EventRoute::RequestsDone,
            other => EventRoute::Disconnected {
                reason: other.to_string(),
            },
        }
    }

    /// Decode a payload as UTF-8 text
    pub fn decode_payload(topic: &str, payload: Vec<u8>) -> Result<String, DecodeError> {
        String::from_utf8(payload).map_err(|source| {
            debug!(target: "mqtt_transport", "Non UTF-8 payload on {}", topic);
            DecodeError {
                topic: topic.to_string(),
                source,
            }
        })
    }
}

/// Payload was not valid UTF-8
#[derive(Debug, thiserror::Error)]
#[error("Payload on topic {topic} is not valid UTF-8")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: std::string::FromUtf8Error,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received; `code` tells whether the broker accepted us
    ConnectionAcknowledged {
        code: ConnectReturnCode,
        session_present: bool,
    },
    /// The broker refused the connection
    ConnectionRefused(ConnectReturnCode),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Connection lost, either by broker request or network error
    Disconnected { reason: String },
    /// SubAck received; `failed` counts rejected filters
    SubscriptionConfirmed { packet_id: u16, failed: usize },
    /// Every request handle was dropped; the loop has nothing left to serve
    RequestsDone,
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Outgoing, Publish, QoS, SubAck, SubscribeReasonCode};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                code: ConnectReturnCode::Success,
                session_present: false,
            }
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "sensors/speed",
            QoS::AtMostOnce,
            "42",
        )));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "sensors/speed");
                assert_eq!(payload, b"42");
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnect_and_outgoing() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected { .. }
        ));
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_route_suback_counts_failures() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                failed: 1
            }
        );
    }

    #[test]
    fn test_route_connection_errors() {
        assert_eq!(
            MessageHandler::route_connection_error(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::BadUserNamePassword
            )),
            EventRoute::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)
        );
        assert_eq!(
            MessageHandler::route_connection_error(&ConnectionError::RequestsDone),
            EventRoute::RequestsDone
        );
        assert!(matches!(
            MessageHandler::route_connection_error(&ConnectionError::NetworkTimeout),
            EventRoute::Disconnected { .. }
        ));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            MessageHandler::decode_payload("t", b"ok".to_vec()).unwrap(),
            "ok"
        );

        let error = MessageHandler::decode_payload("t", vec![0xff, 0xfe, 0x00]).unwrap_err();
        assert_eq!(error.topic, "t");
    }
}
