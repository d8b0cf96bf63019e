//! Dual-write bus: publish to two transports, consume from one.

use std::future::Future;

use tracing::warn;

use courier_domain::event::DomainEvent;

use crate::error::BusError;
use crate::ports::{EventBus, Handler, HookReply, Subscription};

/// Publishes every event to both `local` and `durable`; subscribes only on
/// `durable`.
///
/// Publishing is best-effort on each side: a failure on one transport is
/// logged and never fails the other or the caller.
#[derive(Clone)]
pub struct DualWriteEventBus<L, D> {
    local: L,
    durable: D,
}

impl<L: EventBus, D: EventBus> DualWriteEventBus<L, D> {
    #[must_use]
    pub fn new(local: L, durable: D) -> Self {
        Self { local, durable }
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn durable(&self) -> &D {
        &self.durable
    }
}

impl<L: EventBus, D: EventBus> EventBus for DualWriteEventBus<L, D> {
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
        let event_id = event.id().to_string();
        let local = self.local.publish(event.clone());
        let durable = self.durable.publish(event);
        async move {
            let (local, durable) = tokio::join!(local, durable);
            if let Err(err) = local {
                warn!(event_id, side = "local", error = %err, "dual-write publish failed");
            }
            if let Err(err) = durable {
                warn!(event_id, side = "durable", error = %err, "dual-write publish failed");
            }
            Ok(None)
        }
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError> {
        self.durable.subscribe(pattern, handler)
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        let local = self.local.shutdown();
        let durable = self.durable.shutdown();
        async move {
            tokio::join!(local, durable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcessEventBus;
    use crate::ports::{handler_fn, hook_fn};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bus that refuses everything, standing in for a dead transport.
    struct Refusing;

    impl EventBus for Refusing {
        fn publish(
            &self,
            _event: DomainEvent,
        ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
            async { Err(BusError::Closed) }
        }

        fn subscribe(&self, _pattern: &str, _handler: Handler) -> Result<Subscription, BusError> {
            Err(BusError::Closed)
        }

        fn shutdown(&self) -> impl Future<Output = ()> + Send {
            async {}
        }
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn event() -> DomainEvent {
        DomainEvent::new("order.placed", json!({"id": 1})).unwrap()
    }

    #[tokio::test]
    async fn should_publish_to_both_sides() {
        let local = InProcessEventBus::new();
        let durable = InProcessEventBus::new();
        let local_hits = Arc::new(AtomicUsize::new(0));
        let durable_hits = Arc::new(AtomicUsize::new(0));
        local.subscribe("order.#", counter_handler(&local_hits)).unwrap();
        durable.subscribe("order.#", counter_handler(&durable_hits)).unwrap();

        let bus = DualWriteEventBus::new(local, durable);
        bus.publish(event()).await.unwrap();

        assert_eq!(local_hits.load(Ordering::SeqCst), 1);
        assert_eq!(durable_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_subscribe_only_on_durable_side() {
        let bus = DualWriteEventBus::new(InProcessEventBus::new(), InProcessEventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("order.#", counter_handler(&hits)).unwrap();

        assert_eq!(bus.local().subscription_count(), 0);
        assert_eq!(bus.durable().subscription_count(), 1);
    }

    #[tokio::test]
    async fn should_swallow_failure_on_either_side() {
        let durable = InProcessEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        durable.subscribe("#", counter_handler(&hits)).unwrap();

        let bus = DualWriteEventBus::new(Refusing, durable);
        assert!(bus.publish(event()).await.unwrap().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let bus = DualWriteEventBus::new(InProcessEventBus::new(), Refusing);
        assert!(bus.publish(event()).await.is_ok());
    }

    #[tokio::test]
    async fn should_not_return_local_hook_reply() {
        let local = InProcessEventBus::new();
        local.subscribe("#", handler_fn(|_| async { Ok(()) })).unwrap();
        local.set_publish_hook(hook_fn(|_| async { Some(json!("answer")) }));

        let bus = DualWriteEventBus::new(local, InProcessEventBus::new());
        assert_eq!(bus.publish(event()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn should_shut_down_both_sides() {
        let bus = DualWriteEventBus::new(InProcessEventBus::new(), InProcessEventBus::new());
        bus.local().subscribe("#", handler_fn(|_| async { Ok(()) })).unwrap();
        bus.subscribe("#", handler_fn(|_| async { Ok(()) })).unwrap();

        bus.shutdown().await;
        bus.shutdown().await;

        assert_eq!(bus.local().subscription_count(), 0);
        assert_eq!(bus.durable().subscription_count(), 0);
    }
}
