//! Logging initialisation tests

use pubsub_bridge::observability::{init_logging, LogFormat, LoggingConfig};
use tracing::Level;

#[test]
fn test_second_init_is_refused() {
    let config = LoggingConfig {
        level: Level::DEBUG,
        format: LogFormat::Compact,
        include_spans: true,
    };

    assert!(init_logging(config));
    assert!(!init_logging(LoggingConfig::default()));

    // Logging through an installed subscriber must not panic
    let span = pubsub_bridge::mqtt_span!(role = "publisher");
    let _entered = span.enter();
    tracing::info!("logging initialised");
}
