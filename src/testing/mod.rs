//! Testing utilities and mock implementations
//!
//! Mocks let the client and connection manager run without a broker.

pub mod mocks;

pub use mocks::*;
