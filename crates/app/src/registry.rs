//! Lifecycle registry for a shared bus instance.
//!
//! Replaces a process-wide cached singleton with an owned object: the bus is
//! built lazily by an async factory, concurrent first callers share one
//! construction, and [`BusRegistry::shutdown`] tears it down explicitly.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::ports::EventBus;
use crate::sync::lock;

/// Async constructor for the registry's bus.
pub type BusFactory<B> = Arc<dyn Fn() -> BoxFuture<'static, Result<B, BusError>> + Send + Sync>;

type Construction<B> = Shared<BoxFuture<'static, Result<Arc<B>, BusError>>>;

enum Slot<B> {
    Empty,
    Pending(Construction<B>),
    Ready(Arc<B>),
}

struct State<B> {
    slot: Slot<B>,
    /// Bumped on every reset so late constructions know they were discarded.
    epoch: u64,
}

/// Owns at most one bus instance.
pub struct BusRegistry<B> {
    factory: BusFactory<B>,
    state: Mutex<State<B>>,
}

impl<B: EventBus + 'static> BusRegistry<B> {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<B, BusError>> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || factory().boxed()),
            state: Mutex::new(State {
                slot: Slot::Empty,
                epoch: 0,
            }),
        }
    }

    /// Return the bus, constructing it on first use.
    ///
    /// Concurrent callers during construction all await the same attempt.
    ///
    /// # Errors
    ///
    /// Returns the factory's error. Failures are not cached; the next call
    /// tries again.
    pub async fn get(&self) -> Result<Arc<B>, BusError> {
        let (epoch, construction) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            match &state.slot {
                Slot::Ready(bus) => return Ok(Arc::clone(bus)),
                Slot::Pending(construction) => (state.epoch, construction.clone()),
                Slot::Empty => {
                    debug!("constructing event bus");
                    let factory = Arc::clone(&self.factory);
                    let construction = async move { factory().await.map(Arc::new) }
                        .boxed()
                        .shared();
                    state.slot = Slot::Pending(construction.clone());
                    (state.epoch, construction)
                }
            }
        };

        let result = construction.await;

        let mut state = lock(&self.state);
        if state.epoch == epoch && matches!(state.slot, Slot::Pending(_)) {
            state.slot = match &result {
                Ok(bus) => Slot::Ready(Arc::clone(bus)),
                Err(err) => {
                    warn!(error = %err, "event bus construction failed");
                    Slot::Empty
                }
            };
        }
        result
    }

    /// Forget the cached instance without shutting it down.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.epoch += 1;
        state.slot = Slot::Empty;
    }

    /// Shut down the instance, if any, then reset.
    ///
    /// A construction still in flight is awaited and its result shut down.
    pub async fn shutdown(&self) {
        let slot = {
            let mut state = lock(&self.state);
            state.epoch += 1;
            std::mem::replace(&mut state.slot, Slot::Empty)
        };
        let bus = match slot {
            Slot::Empty => return,
            Slot::Ready(bus) => bus,
            Slot::Pending(construction) => match construction.await {
                Ok(bus) => bus,
                Err(_) => return,
            },
        };
        bus.shutdown().await;
        info!("event bus registry shut down");
    }

    /// Whether a constructed instance is cached.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(lock(&self.state).slot, Slot::Ready(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcessEventBus;
    use crate::ports::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_registry(built: &Arc<AtomicUsize>) -> BusRegistry<InProcessEventBus> {
        let built = Arc::clone(built);
        BusRegistry::new(move || {
            let built = Arc::clone(&built);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                built.fetch_add(1, Ordering::SeqCst);
                Ok(InProcessEventBus::new())
            }
        })
    }

    #[tokio::test]
    async fn should_construct_once_and_cache() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);

        let first = registry.get().await.unwrap();
        let second = registry.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(registry.is_ready());
    }

    #[tokio::test]
    async fn should_share_in_flight_construction() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);

        let (a, b, c) = tokio::join!(registry.get(), registry.get(), registry.get());

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_not_cache_failed_construction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = BusRegistry::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(BusError::Closed)
                } else {
                    Ok(InProcessEventBus::new())
                }
            }
        });

        assert!(matches!(registry.get().await, Err(BusError::Closed)));
        assert!(!registry.is_ready());
        assert!(registry.get().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_build_new_instance_after_reset() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);

        let first = registry.get().await.unwrap();
        registry.reset();
        let second = registry.get().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_discard_construction_interrupted_by_reset() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);

        let (early, ()) = tokio::join!(registry.get(), async { registry.reset() });

        assert!(early.is_ok());
        assert!(!registry.is_ready());
        let fresh = registry.get().await.unwrap();
        assert!(!Arc::ptr_eq(&early.unwrap(), &fresh));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_shut_down_cached_bus() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);
        let bus = registry.get().await.unwrap();
        bus.subscribe("#", handler_fn(|_| async { Ok(()) })).unwrap();

        registry.shutdown().await;
        registry.shutdown().await;

        assert_eq!(bus.subscription_count(), 0);
        assert!(!registry.is_ready());
    }

    #[tokio::test]
    async fn should_do_nothing_when_shutting_down_empty_registry() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&built);
        registry.shutdown().await;
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }
}
