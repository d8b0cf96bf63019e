//! # courier-adapter-memory
//!
//! In-memory implementation of the broker port.
//!
//! ## Responsibilities
//! - Topic exchanges with native `*` / `#` routing
//! - Exclusive, auto-delete subscriber queues with dead-lettering on reject
//! - Loss signals for connections and channels
//! - Fault injection (`sever`, `fail_channels`, `set_refusing`,
//!   `set_nacking`) so the durable bus's recovery paths can be driven
//!   deterministically
//!
//! ## Dependency rule
//! Depends on `courier-app` and `courier-domain`. Nothing depends on this
//! crate outside tests and demos.

mod broker;
pub mod error;

pub use broker::{MemoryBroker, MemoryChannel, MemoryConnection, MemoryDelivery, PublishedMessage};
pub use error::MemoryBrokerError;
