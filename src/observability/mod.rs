//! Observability: structured logging and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat, LoggingConfig};

pub use logging::{lifecycle_span, mqtt_span};
