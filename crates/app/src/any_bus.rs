//! Bus flavour chosen at runtime.

use std::future::Future;

use futures::future::Either;

use courier_domain::event::DomainEvent;

use crate::durable_bus::DurableEventBus;
use crate::dual_write::DualWriteEventBus;
use crate::error::BusError;
use crate::event_bus::InProcessEventBus;
use crate::ports::{Broker, EventBus, Handler, HookReply, Subscription};

/// One of the three bus flavours, selected by configuration.
pub enum AnyEventBus<B: Broker> {
    InProcess(InProcessEventBus),
    Durable(DurableEventBus<B>),
    DualWrite(DualWriteEventBus<InProcessEventBus, DurableEventBus<B>>),
}

impl<B: Broker> AnyEventBus<B> {
    /// Short name of the flavour, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InProcess(_) => "in_process",
            Self::Durable(_) => "durable",
            Self::DualWrite(_) => "dual",
        }
    }
}

impl<B: Broker> EventBus for AnyEventBus<B> {
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
        match self {
            Self::InProcess(bus) => Either::Left(bus.publish(event)),
            Self::Durable(bus) => Either::Right(Either::Left(bus.publish(event))),
            Self::DualWrite(bus) => Either::Right(Either::Right(bus.publish(event))),
        }
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError> {
        match self {
            Self::InProcess(bus) => bus.subscribe(pattern, handler),
            Self::Durable(bus) => bus.subscribe(pattern, handler),
            Self::DualWrite(bus) => bus.subscribe(pattern, handler),
        }
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        match self {
            Self::InProcess(bus) => Either::Left(bus.shutdown()),
            Self::Durable(bus) => Either::Right(Either::Left(bus.shutdown())),
            Self::DualWrite(bus) => Either::Right(Either::Right(bus.shutdown())),
        }
    }
}
