//! Per-subscription consumer bookkeeping.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use courier_domain::id::SubscriptionId;
use courier_domain::topic::TopicPattern;
use courier_domain::validate_domain_event_bytes;

use crate::dispatch::{HandlerOutcome, run_handler};
use crate::ports::{BrokerChannel, Delivery, Handler};
use crate::sync::lock;

enum Binding<C> {
    Idle,
    Pending,
    Bound { tag: String, channel: C },
}

/// Consumer attached to a subscription, tagged with the link generation it
/// was opened on.
struct ConsumerSlot<C> {
    generation: u64,
    binding: Binding<C>,
}

pub(super) struct DurableSubscription<C> {
    pub(super) id: SubscriptionId,
    pub(super) pattern: TopicPattern,
    pub(super) handler: Handler,
    active: AtomicBool,
    consumer: Mutex<ConsumerSlot<C>>,
}

impl<C: BrokerChannel> DurableSubscription<C> {
    pub(super) fn new(id: SubscriptionId, pattern: TopicPattern, handler: Handler) -> Self {
        Self {
            id,
            pattern,
            handler,
            active: AtomicBool::new(true),
            consumer: Mutex::new(ConsumerSlot {
                generation: 0,
                binding: Binding::Idle,
            }),
        }
    }

    pub(super) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery and hand back the consumer to cancel, if one is bound.
    pub(super) fn deactivate(&self) -> Option<(String, C)> {
        self.active.store(false, Ordering::Release);
        let mut slot = lock(&self.consumer);
        match std::mem::replace(&mut slot.binding, Binding::Idle) {
            Binding::Bound { tag, channel } => Some((tag, channel)),
            Binding::Idle | Binding::Pending => None,
        }
    }

    /// Reserve consumer setup for `generation`. Returns `false` when the
    /// subscription is gone or already has (or is getting) a consumer there.
    pub(super) fn claim(&self, generation: u64) -> bool {
        let mut slot = lock(&self.consumer);
        if !self.is_active() {
            return false;
        }
        if slot.generation == generation && !matches!(slot.binding, Binding::Idle) {
            return false;
        }
        slot.generation = generation;
        slot.binding = Binding::Pending;
        true
    }

    /// Undo a [`claim`](Self::claim) after a failed setup.
    pub(super) fn release(&self, generation: u64) {
        let mut slot = lock(&self.consumer);
        if slot.generation == generation && matches!(slot.binding, Binding::Pending) {
            slot.binding = Binding::Idle;
        }
    }

    /// Record the consumer opened for `generation`. Hands the consumer back
    /// when it is no longer wanted.
    pub(super) fn bind(&self, generation: u64, tag: String, channel: C) -> Result<(), (String, C)> {
        let mut slot = lock(&self.consumer);
        if !self.is_active() || slot.generation != generation {
            return Err((tag, channel));
        }
        slot.binding = Binding::Bound { tag, channel };
        Ok(())
    }

    pub(super) fn consumer_tag(&self) -> Option<String> {
        match &lock(&self.consumer).binding {
            Binding::Bound { tag, .. } => Some(tag.clone()),
            Binding::Idle | Binding::Pending => None,
        }
    }
}

/// Settle a consumer's deliveries, at most `limit` at a time, until the
/// stream ends. Deliveries arriving after the subscription was cancelled are
/// rejected unprocessed.
pub(super) async fn consume<C: BrokerChannel>(
    record: Arc<DurableSubscription<C>>,
    deliveries: BoxStream<'static, C::Delivery>,
    limit: usize,
) {
    deliveries
        .for_each_concurrent(Some(limit.max(1)), |delivery| {
            let record = Arc::clone(&record);
            async move {
                if record.is_active() {
                    settle(&record, delivery).await;
                } else {
                    discard(&record, delivery).await;
                }
            }
        })
        .await;
    debug!(subscription = %record.id, "consumer stopped");
}

async fn discard<C: BrokerChannel>(record: &DurableSubscription<C>, delivery: C::Delivery) {
    debug!(subscription = %record.id, "rejecting delivery for cancelled subscription");
    if let Err(err) = delivery.reject().await {
        debug!(error = %err, "reject failed");
    }
}

async fn settle<C: BrokerChannel>(record: &DurableSubscription<C>, delivery: C::Delivery) {
    let event = match validate_domain_event_bytes(delivery.body()) {
        Ok(event) => event,
        Err(err) => {
            warn!(
                subscription = %record.id,
                pattern = record.pattern.as_str(),
                error = %err,
                "rejecting invalid message"
            );
            if let Err(err) = delivery.reject().await {
                debug!(error = %err, "reject failed");
            }
            return;
        }
    };

    let event_id = event.id().to_string();
    let event_type = event.event_type().to_string();
    let settled = match run_handler(&record.handler, event).await {
        HandlerOutcome::Completed => delivery.ack().await,
        HandlerOutcome::Failed(err) => {
            warn!(
                subscription = %record.id,
                event_id,
                event_type,
                error = %err,
                "handler failed; dead-lettering"
            );
            delivery.reject().await
        }
        HandlerOutcome::Panicked => {
            warn!(
                subscription = %record.id,
                event_id,
                event_type,
                "handler panicked; dead-lettering"
            );
            delivery.reject().await
        }
    };
    if let Err(err) = settled {
        debug!(event_id, error = %err, "failed to settle delivery");
    }
}
