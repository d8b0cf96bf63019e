//! # courier-app
//!
//! Application layer: the event bus port and its implementations.
//!
//! ## Responsibilities
//! - Define **port traits**:
//!   - `EventBus`: publish, subscribe, shutdown
//!   - `Broker` / `BrokerConnection` / `BrokerChannel` / `Delivery`: the
//!     topic-exchange broker the durable bus runs on
//! - Provide the bus flavours:
//!   - `InProcessEventBus`: pattern fan-out inside one process
//!   - `DurableEventBus`: broker-backed, with reconnection and buffering
//!   - `DualWriteEventBus`: both at once
//! - Carry the correlation id of the event being handled (`correlation`)
//! - Own the bus lifecycle (`BusRegistry`)
//!
//! ## Dependency rule
//! Depends on `courier-domain` only. Broker adapters depend on *this* crate,
//! not the reverse.

pub mod any_bus;
pub mod correlation;
pub mod dispatch;
pub mod dual_write;
pub mod durable_bus;
pub mod error;
pub mod event_bus;
pub mod ports;
pub mod registry;
mod sync;

pub use any_bus::AnyEventBus;
pub use dual_write::DualWriteEventBus;
pub use durable_bus::{ConnectionState, DurableBusConfig, DurableEventBus, ReconnectConfig};
pub use error::{BrokerError, BusError};
pub use event_bus::InProcessEventBus;
pub use registry::BusRegistry;
