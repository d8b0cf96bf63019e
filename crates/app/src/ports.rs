//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the outside world.
//! They are defined here (in `app`) so that both the buses and the broker
//! adapters can depend on them without creating circular dependencies.

pub mod broker;
pub mod event_bus;

pub use broker::{
    Broker, BrokerChannel, BrokerConnection, Consumer, Delivery, LossNotifier, LossSignal,
    MessageProperties, loss_channel,
};
pub use event_bus::{
    EventBus, Handler, HandlerError, HookReply, PublishHook, Subscription, handler_fn, hook_fn,
};
