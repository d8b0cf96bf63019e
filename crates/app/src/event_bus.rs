//! In-process event bus with pattern subscriptions and concurrent fan-out.

use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use futures::future::join_all;
use tracing::{debug, warn};

use courier_domain::event::DomainEvent;
use courier_domain::id::SubscriptionId;
use courier_domain::topic::TopicPattern;

use crate::dispatch::{HandlerOutcome, run_handler};
use crate::error::BusError;
use crate::ports::{EventBus, Handler, HookReply, PublishHook, Subscription};
use crate::sync::{read, write};

struct LocalSubscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    /// Replaced wholesale on every change so in-flight publishes keep
    /// iterating the snapshot they started with.
    subscriptions: RwLock<Arc<Vec<Arc<LocalSubscription>>>>,
    hook: RwLock<Option<PublishHook>>,
}

impl Registry {
    fn snapshot(&self) -> Arc<Vec<Arc<LocalSubscription>>> {
        Arc::clone(&read(&self.subscriptions))
    }

    fn add(&self, subscription: LocalSubscription) {
        let mut current = write(&self.subscriptions);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::new(subscription));
        *current = Arc::new(next);
    }

    fn remove(&self, id: SubscriptionId) {
        let mut current = write(&self.subscriptions);
        if !current.iter().any(|s| s.id == id) {
            return;
        }
        let next = current.iter().filter(|s| s.id != id).cloned().collect();
        *current = Arc::new(next);
    }

    fn hook(&self) -> Option<PublishHook> {
        read(&self.hook).clone()
    }
}

/// In-process event bus.
///
/// Handlers whose pattern matches a published event run concurrently; a
/// failing or panicking handler never affects its siblings or the
/// publisher. Publishing succeeds even when nothing matches.
///
/// The bus also carries a single-slot *publish hook*: after all handlers
/// settle, the most recently registered hook is called and its reply becomes
/// the result of [`publish`](EventBus::publish). This is how one collaborator
/// gets a synchronous answer out of a publication while every other
/// subscriber only observes.
#[derive(Clone, Default)]
pub struct InProcessEventBus {
    registry: Arc<Registry>,
}

impl InProcessEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the publish hook, replacing any previous one.
    pub fn set_publish_hook(&self, hook: PublishHook) {
        *write(&self.registry.hook) = Some(hook);
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.snapshot().len()
    }
}

impl EventBus for InProcessEventBus {
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
        let registry = Arc::clone(&self.registry);
        let snapshot = registry.snapshot();
        async move {
            let matching: Vec<Arc<LocalSubscription>> = snapshot
                .iter()
                .filter(|s| s.pattern.matches(event.event_type()))
                .cloned()
                .collect();
            if matching.is_empty() {
                debug!(event_type = event.event_type(), "no subscribers matched");
                return Ok(None);
            }

            let outcomes = join_all(
                matching
                    .iter()
                    .map(|s| run_handler(&s.handler, event.clone())),
            )
            .await;
            report_outcomes(&event, &matching, &outcomes);

            match registry.hook() {
                Some(hook) => Ok(hook(event).await),
                None => Ok(None),
            }
        }
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError> {
        let compiled = TopicPattern::compile(pattern)?;
        let id = SubscriptionId::new();
        self.registry.add(LocalSubscription {
            id,
            pattern: compiled,
            handler,
        });
        debug!(%id, pattern, "subscribed");

        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        Ok(Subscription::new(id, pattern, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        }))
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        *write(&self.registry.subscriptions) = Arc::new(Vec::new());
        *write(&self.registry.hook) = None;
        async {}
    }
}

fn report_outcomes(
    event: &DomainEvent,
    subscriptions: &[Arc<LocalSubscription>],
    outcomes: &[HandlerOutcome],
) {
    let failed = outcomes.iter().filter(|o| !o.is_completed()).count();
    if failed == 0 {
        return;
    }
    for (subscription, outcome) in subscriptions.iter().zip(outcomes) {
        match outcome {
            HandlerOutcome::Completed => {}
            HandlerOutcome::Failed(err) => warn!(
                event_id = event.id(),
                event_type = event.event_type(),
                subscription = %subscription.id,
                pattern = subscription.pattern.as_str(),
                error = %err,
                "handler failed"
            ),
            HandlerOutcome::Panicked => warn!(
                event_id = event.id(),
                event_type = event.event_type(),
                subscription = %subscription.id,
                pattern = subscription.pattern.as_str(),
                "handler panicked"
            ),
        }
    }
    warn!(
        event_id = event.id(),
        failed,
        total = outcomes.len(),
        "discarded handler failures"
    );
}
