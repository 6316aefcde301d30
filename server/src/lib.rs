//! Connection drivers for the HTTP/1.1 and HTTP/2 engines.
//!
//! Detects the protocol of an accepted byte channel and drives it with the
//! blocking HTTP/1.1 loop or the HTTP/2 reader, dispatching requests to
//! application callbacks. Configuration, logging and metrics for the
//! `wire-server` tool live here too.

pub mod config;
pub mod connection;
pub mod decode;
pub mod h1;
pub mod h2;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use connection::{DriverError, Protocol, detect, serve};
pub use h1::{Dispatcher, Response};
