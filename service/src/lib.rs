//! # Registration Service
//!
//! Wires the registration store to a request transport:
//!
//! - [`config`]: environment-driven configuration
//! - [`dispatcher`]: validates a request, applies it under a deadline, acks or nacks
//! - [`consumer`]: subscribe-process-reconnect loop with bounded concurrency
//! - [`metrics`]: Prometheus metric descriptions and recording
//!
//! The binary (`registration-service`) connects `PostgreSQL` and Redpanda and
//! runs one [`consumer::RequestConsumer`] until it receives a shutdown signal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod metrics;

pub use config::Config;
pub use consumer::RequestConsumer;
pub use dispatcher::{DispatchOutcome, RequestDispatcher};
