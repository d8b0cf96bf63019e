//! Event bus port — publish/subscribe for domain events.
//!
//! Every bus flavour (in-process, durable, dual-write) implements
//! [`EventBus`]; producers and consumers only ever see this trait.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use courier_domain::event::DomainEvent;
use courier_domain::id::SubscriptionId;

use crate::error::BusError;

/// Value a publish resolves with: the publish hook's reply on the
/// in-process bus, `None` everywhere else.
pub type HookReply = Option<Value>;

/// Error a handler reports for a single event.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Asynchronous event handler shared between a bus and its caller.
pub type Handler =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Callback run after in-process fan-out whose reply becomes the publish result.
pub type PublishHook = Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, HookReply> + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Build a [`PublishHook`] from an async closure.
pub fn hook_fn<F, Fut>(f: F) -> PublishHook
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookReply> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Handle returned by [`EventBus::subscribe`].
///
/// [`unsubscribe`](Self::unsubscribe) stops delivery immediately and may be
/// called any number of times. Dropping the handle does **not** unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: String,
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Wrap a bus-specific removal callback. The callback must be idempotent.
    pub fn new(
        id: SubscriptionId,
        pattern: impl Into<String>,
        cancel: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            pattern: pattern.into(),
            cancel: Arc::new(cancel),
        }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Remove the subscription from its bus.
    pub fn unsubscribe(&self) {
        (self.cancel)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Publishes domain events and routes them to pattern subscribers.
pub trait EventBus: Send + Sync {
    /// Publish an event to every matching subscriber.
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send;

    /// Register `handler` for every event whose type matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the pattern is malformed or the bus is closed.
    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError>;

    /// Release every resource. Safe to call more than once.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

impl<T: EventBus> EventBus for Arc<T> {
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
        (**self).publish(event)
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError> {
        (**self).subscribe(pattern, handler)
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        (**self).shutdown()
    }
}
