//! Middleware wiring
//!
//! Resolves broker, proxy and certificate locations through a
//! [`ServiceLocator`] and builds the pub/sub client from them.

pub mod locator;
pub mod native;

pub use locator::{
    ConfigServiceLocator, ServiceCertificates, ServiceLocator, MQTT_PROXY_SERVICE, MQTT_SERVICE,
};
pub use native::NativeMiddleware;
