//! # courier-adapter-amqp-lapin
//!
//! AMQP 0-9-1 adapter for the broker port, built on `lapin`.
//!
//! ## Responsibilities
//! - Open connections and confirm-mode channels
//! - Declare durable topic exchanges and exclusive, auto-delete subscriber
//!   queues dead-lettering to a configured exchange
//! - Publish persistent messages and wait for publisher confirms
//! - Turn connection and channel failures into loss signals so the durable
//!   bus can reconnect
//!
//! ## Dependency rule
//! Depends on `courier-app` only.

mod broker;
pub mod config;
pub mod error;

pub use broker::{LapinBroker, LapinChannel, LapinConnection, LapinDelivery};
pub use config::AmqpConfig;
pub use error::LapinError;
