//! Durable event bus over a topic-exchange broker.
//!
//! Events are published as persistent JSON messages to a durable topic
//! exchange with the event type as routing key. Each subscription gets its
//! own exclusive queue bound with the subscription pattern; messages a
//! handler fails on, and messages that do not validate, are rejected
//! without requeue and end up on the dead-letter exchange.
//!
//! # Connection lifecycle
//!
//! ```text
//!   connect() ──► Connected ──loss──► Reconnecting ──established──► Connected
//!                    │                    │ (buffer flushed first)
//!                    │                    └──attempts exhausted──► Closed
//!                    └──loss, reconnect disabled──────────────────► Closed
//!   shutdown() from any state ───────────────────────────────────► Closed
//! ```
//!
//! While reconnecting, publishes are held in a bounded FIFO buffer and
//! resolve once they are flushed on the new channel. The bus reports
//! `Connected` again only after that buffer is empty, so buffered events
//! always reach the broker before anything published afterwards.

mod backoff;
mod config;
mod subscription;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_domain::event::DomainEvent;
use courier_domain::id::SubscriptionId;
use courier_domain::time::epoch_seconds;
use courier_domain::topic::TopicPattern;

use crate::error::{BrokerError, BusError};
use crate::ports::{
    Broker, BrokerChannel, BrokerConnection, Consumer, EventBus, Handler, HookReply,
    MessageProperties, Subscription,
};
use crate::sync::lock;

pub use backoff::Backoff;
pub use config::{DurableBusConfig, ReconnectConfig};

use subscription::{DurableSubscription, consume};

const CONTENT_TYPE: &str = "application/json";

/// Link state as seen by publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        })
    }
}

type ConnectionOf<B> = <B as Broker>::Connection;
type ChannelOf<B> = <ConnectionOf<B> as BrokerConnection>::Channel;
type Record<B> = DurableSubscription<ChannelOf<B>>;

/// A publish waiting for the link to come back.
struct Buffered {
    event: DomainEvent,
    reply: oneshot::Sender<Result<(), BusError>>,
}

struct Link<B: Broker> {
    state: ConnectionState,
    connection: Option<ConnectionOf<B>>,
    channel: Option<ChannelOf<B>>,
    /// Bumped every time a new connection goes live.
    generation: u64,
    buffer: VecDeque<Buffered>,
    watcher: Option<JoinHandle<()>>,
    shut_down: bool,
}

enum Route<C> {
    Direct(C, DomainEvent),
    Queued(oneshot::Receiver<Result<(), BusError>>),
    Refused(BusError),
}

enum FlushStep {
    Publish(Buffered),
    Live,
    Abandon,
}

struct Shared<B: Broker> {
    broker: B,
    config: DurableBusConfig,
    link: Mutex<Link<B>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<Record<B>>>>,
    closing: watch::Sender<bool>,
}

/// Event bus backed by a durable broker.
///
/// Cloning is cheap and every clone drives the same connection.
/// [`subscribe`](EventBus::subscribe) and unsubscribing spawn background
/// work and must be called from within a Tokio runtime.
pub struct DurableEventBus<B: Broker> {
    shared: Arc<Shared<B>>,
}

impl<B: Broker> Clone for DurableEventBus<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Broker> DurableEventBus<B> {
    /// Connect, open a channel and declare both exchanges.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Broker`] if the initial connection or topology
    /// setup fails. Only losses after this point trigger reconnection.
    pub async fn connect(broker: B, config: DurableBusConfig) -> Result<Self, BusError> {
        let (closing, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            broker,
            config,
            link: Mutex::new(Link {
                state: ConnectionState::Reconnecting,
                connection: None,
                channel: None,
                generation: 0,
                buffer: VecDeque::new(),
                watcher: None,
                shut_down: false,
            }),
            subscriptions: Mutex::new(HashMap::new()),
            closing,
        });

        let (connection, channel) = shared.establish().await?;
        {
            let mut link = lock(&shared.link);
            shared.go_live(&mut link, connection, channel);
        }
        info!(
            exchange = shared.config.exchange,
            dead_letter_exchange = shared.config.dead_letter_exchange,
            "durable event bus connected"
        );
        Ok(Self { shared })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.link).state
    }

    /// Publishes currently waiting for reconnection.
    #[must_use]
    pub fn buffered(&self) -> usize {
        lock(&self.shared.link).buffer.len()
    }

    /// Subscriptions that have not been cancelled.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Broker consumer tag currently serving a subscription.
    #[must_use]
    pub fn consumer_tag(&self, id: SubscriptionId) -> Option<String> {
        let record = lock(&self.shared.subscriptions).get(&id).cloned();
        record.and_then(|r| r.consumer_tag())
    }
}

impl<B: Broker> Shared<B> {
    async fn establish(&self) -> Result<(ConnectionOf<B>, ChannelOf<B>), BrokerError> {
        let connection = self.broker.connect().await?;
        match self.prepare_channel(&connection).await {
            Ok(channel) => Ok((connection, channel)),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "failed to close half-open connection");
                }
                Err(err)
            }
        }
    }

    async fn prepare_channel(
        &self,
        connection: &ConnectionOf<B>,
    ) -> Result<ChannelOf<B>, BrokerError> {
        let channel = connection
            .open_channel(self.config.publisher_confirms)
            .await?;
        channel.declare_exchange(&self.config.exchange).await?;
        channel
            .declare_exchange(&self.config.dead_letter_exchange)
            .await?;
        channel.set_prefetch(self.config.prefetch).await?;
        Ok(channel)
    }

    /// Install fresh handles and start watching them. Caller holds the link lock.
    fn go_live(
        self: &Arc<Self>,
        link: &mut Link<B>,
        connection: ConnectionOf<B>,
        channel: ChannelOf<B>,
    ) {
        link.generation += 1;
        link.watcher = Some(self.watch_link(link.generation, &connection, &channel));
        link.connection = Some(connection);
        link.channel = Some(channel);
        link.state = ConnectionState::Connected;
    }

    fn watch_link(
        self: &Arc<Self>,
        generation: u64,
        connection: &ConnectionOf<B>,
        channel: &ChannelOf<B>,
    ) -> JoinHandle<()> {
        let connection_lost = connection.loss_signal();
        let channel_lost = channel.loss_signal();
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                reason = connection_lost.lost() => format!("connection lost: {reason}"),
                reason = channel_lost.lost() => format!("channel lost: {reason}"),
            };
            if let Some(shared) = shared.upgrade() {
                shared.on_link_lost(generation, &reason);
            }
        })
    }

    fn on_link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut link = lock(&self.link);
        if link.generation != generation || link.state != ConnectionState::Connected {
            debug!(generation, reason, "ignoring loss of a retired link");
            return;
        }
        let retired = link.connection.take();
        link.channel = None;
        link.watcher = None;

        if self.config.reconnect.enabled {
            link.state = ConnectionState::Reconnecting;
            drop(link);
            warn!(reason, "broker link lost; reconnecting");
            tokio::spawn(Self::reconnect(Arc::downgrade(self), self.closing.subscribe()));
        } else {
            link.state = ConnectionState::Closed;
            drop(link);
            self.closing.send_replace(true);
            error!(reason, "broker link lost and reconnect is disabled; event bus closed");
        }

        // A failed channel can leave its connection up.
        if let Some(connection) = retired {
            tokio::spawn(async move {
                if let Err(err) = connection.close().await {
                    debug!(error = %err, "failed to close retired connection");
                }
            });
        }
    }

    /// Retry until the link is back, the budget runs out, or the bus goes
    /// away. Only a weak handle is held between attempts.
    async fn reconnect(shared: Weak<Self>, mut closing: watch::Receiver<bool>) {
        let (backoff, max_attempts) = match shared.upgrade() {
            Some(bus) => (
                Backoff::from(&bus.config.reconnect),
                bus.config.reconnect.max_attempts,
            ),
            None => return,
        };
        let mut attempt: u32 = 0;
        loop {
            let delay = backoff.delay(attempt);
            info!(
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling reconnect"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = closing.wait_for(|closed| *closed) => return,
            }

            let Some(bus) = shared.upgrade() else {
                debug!("event bus dropped; abandoning reconnect");
                return;
            };
            match bus.establish().await {
                Ok((connection, channel)) => {
                    bus.resume(connection, channel).await;
                    return;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if max_attempts > 0 && attempt >= max_attempts {
                        bus.give_up(attempt);
                        return;
                    }
                    warn!(attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    /// Restore consumers, flush the buffer, then go live.
    async fn resume(self: &Arc<Self>, connection: ConnectionOf<B>, channel: ChannelOf<B>) {
        let generation = lock(&self.link).generation + 1;
        self.restore_consumers(&channel, generation).await;

        let mut connection = Some(connection);
        let mut flushed: usize = 0;
        loop {
            let step = {
                let mut link = lock(&self.link);
                if link.state == ConnectionState::Closed {
                    FlushStep::Abandon
                } else if let Some(entry) = link.buffer.pop_front() {
                    FlushStep::Publish(entry)
                } else {
                    if let Some(connection) = connection.take() {
                        self.go_live(&mut link, connection, channel.clone());
                    }
                    FlushStep::Live
                }
            };
            match step {
                FlushStep::Publish(entry) => {
                    let result = publish_on(&channel, &self.config.exchange, &entry.event).await;
                    if let Err(err) = &result {
                        warn!(event_id = entry.event.id(), error = %err, "buffered publish failed");
                    }
                    let _ = entry.reply.send(result);
                    flushed += 1;
                }
                FlushStep::Live => break,
                FlushStep::Abandon => {
                    debug!("bus closed while reconnecting; dropping new link");
                    close_quietly(&channel, connection.as_ref()).await;
                    return;
                }
            }
        }
        info!(generation, flushed, "reconnected");

        // Catch subscriptions added while the flush was running.
        self.restore_consumers(&channel, generation).await;
    }

    async fn restore_consumers(&self, channel: &ChannelOf<B>, generation: u64) {
        let records: Vec<Arc<Record<B>>> =
            lock(&self.subscriptions).values().cloned().collect();
        for record in records {
            if let Err(err) = self
                .setup_consumer(&record, channel.clone(), generation)
                .await
            {
                warn!(
                    subscription = %record.id,
                    pattern = record.pattern.as_str(),
                    error = %err,
                    "failed to restore consumer"
                );
            }
        }
    }

    fn give_up(&self, attempts: u32) {
        let stranded = {
            let mut link = lock(&self.link);
            if link.state == ConnectionState::Closed {
                return;
            }
            link.state = ConnectionState::Closed;
            std::mem::take(&mut link.buffer)
        };
        self.closing.send_replace(true);
        error!(
            attempts,
            stranded = stranded.len(),
            "reconnect attempts exhausted; event bus closed"
        );
        for entry in stranded {
            let _ = entry
                .reply
                .send(Err(BusError::ReconnectExhausted { attempts }));
        }
    }

    fn route(&self, event: DomainEvent) -> Route<ChannelOf<B>> {
        let mut link = lock(&self.link);
        match link.state {
            ConnectionState::Closed => Route::Refused(BusError::Closed),
            ConnectionState::Reconnecting => {
                let capacity = self.config.reconnect.buffer_capacity;
                if link.buffer.len() >= capacity {
                    warn!(
                        event_id = event.id(),
                        event_type = event.event_type(),
                        capacity,
                        "publish buffer full; refusing event"
                    );
                    return Route::Refused(BusError::BufferFull { capacity });
                }
                let (reply, rx) = oneshot::channel();
                debug!(event_id = event.id(), buffered = link.buffer.len() + 1, "buffering publish");
                link.buffer.push_back(Buffered { event, reply });
                Route::Queued(rx)
            }
            ConnectionState::Connected => match link.channel.clone() {
                Some(channel) => Route::Direct(channel, event),
                None => Route::Refused(BusError::Closed),
            },
        }
    }

    async fn setup_consumer(
        &self,
        record: &Arc<Record<B>>,
        channel: ChannelOf<B>,
        generation: u64,
    ) -> Result<(), BrokerError> {
        if !record.claim(generation) {
            return Ok(());
        }
        let Consumer { tag, deliveries } = match self.open_consumer(record, &channel).await {
            Ok(consumer) => consumer,
            Err(err) => {
                record.release(generation);
                return Err(err);
            }
        };

        if let Err((tag, channel)) = record.bind(generation, tag.clone(), channel) {
            debug!(subscription = %record.id, tag, "subscription gone before consumer started");
            if let Err(err) = channel.cancel(&tag).await {
                debug!(tag, error = %err, "consumer cancel failed");
            }
            return Ok(());
        }
        debug!(
            subscription = %record.id,
            pattern = record.pattern.as_str(),
            tag,
            generation,
            "consumer started"
        );
        tokio::spawn(consume(
            Arc::clone(record),
            deliveries,
            usize::from(self.config.prefetch),
        ));
        Ok(())
    }

    async fn open_consumer(
        &self,
        record: &Record<B>,
        channel: &ChannelOf<B>,
    ) -> Result<Consumer<<ChannelOf<B> as BrokerChannel>::Delivery>, BrokerError> {
        let queue = channel
            .declare_subscriber_queue(&self.config.dead_letter_exchange)
            .await?;
        channel
            .bind_queue(&queue, &self.config.exchange, record.pattern.as_str())
            .await?;
        channel.consume(&queue).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let Some(record) = lock(&self.subscriptions).remove(&id) else {
            return;
        };
        let binding = record.deactivate();
        debug!(%id, pattern = record.pattern.as_str(), "unsubscribed");

        let Some((tag, channel)) = binding else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            debug!(tag, "no runtime to cancel consumer on");
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = channel.cancel(&tag).await {
                debug!(tag, error = %err, "consumer cancel failed");
            }
        });
    }

    async fn shutdown(&self) {
        let (connection, channel, stranded, watcher) = {
            let mut link = lock(&self.link);
            if link.shut_down {
                return;
            }
            link.shut_down = true;
            link.state = ConnectionState::Closed;
            (
                link.connection.take(),
                link.channel.take(),
                std::mem::take(&mut link.buffer),
                link.watcher.take(),
            )
        };
        self.closing.send_replace(true);
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        for entry in stranded {
            let _ = entry.reply.send(Err(BusError::Closed));
        }

        let records: Vec<Arc<Record<B>>> = lock(&self.subscriptions)
            .drain()
            .map(|(_, record)| record)
            .collect();
        for record in records {
            if let Some((tag, consumer_channel)) = record.deactivate()
                && let Err(err) = consumer_channel.cancel(&tag).await
            {
                debug!(tag, error = %err, "consumer cancel failed");
            }
        }

        if let Some(channel) = channel {
            close_quietly(&channel, connection.as_ref()).await;
        }
        info!("durable event bus shut down");
    }
}

async fn publish_on<C: BrokerChannel>(
    channel: &C,
    exchange: &str,
    event: &DomainEvent,
) -> Result<(), BusError> {
    let body = serde_json::to_vec(event)?;
    let properties = MessageProperties {
        persistent: true,
        content_type: CONTENT_TYPE.to_string(),
        message_id: event.id().to_string(),
        timestamp: epoch_seconds(event.timestamp()),
    };
    channel
        .publish(exchange, event.event_type(), body, properties)
        .await?;
    debug!(
        event_id = event.id(),
        event_type = event.event_type(),
        exchange,
        "published"
    );
    Ok(())
}

async fn close_quietly<C: BrokerChannel, K: BrokerConnection>(channel: &C, connection: Option<&K>) {
    if let Err(err) = channel.close().await {
        debug!(error = %err, "channel close failed");
    }
    if let Some(connection) = connection
        && let Err(err) = connection.close().await
    {
        debug!(error = %err, "connection close failed");
    }
}

impl<B: Broker> EventBus for DurableEventBus<B> {
    fn publish(
        &self,
        event: DomainEvent,
    ) -> impl Future<Output = Result<HookReply, BusError>> + Send {
        let route = self.shared.route(event);
        let shared = Arc::clone(&self.shared);
        async move {
            match route {
                Route::Refused(err) => Err(err),
                Route::Queued(reply) => reply.await.unwrap_or(Err(BusError::Closed)).map(|()| None),
                Route::Direct(channel, event) => {
                    publish_on(&channel, &shared.config.exchange, &event)
                        .await
                        .map(|()| None)
                }
            }
        }
    }

    fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription, BusError> {
        let compiled = TopicPattern::compile(pattern)?;
        let id = SubscriptionId::new();
        let record = Arc::new(DurableSubscription::new(id, compiled, handler));

        let live = {
            let link = lock(&self.shared.link);
            let live = match link.state {
                ConnectionState::Closed => return Err(BusError::Closed),
                ConnectionState::Reconnecting => None,
                ConnectionState::Connected => {
                    link.channel.clone().map(|channel| (channel, link.generation))
                }
            };
            // Registered under the link lock so a reconnect in progress
            // either sees this record or hands it a live channel.
            lock(&self.shared.subscriptions).insert(id, Arc::clone(&record));
            live
        };

        if let Some((channel, generation)) = live {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(err) = shared.setup_consumer(&record, channel, generation).await {
                    warn!(
                        subscription = %record.id,
                        pattern = record.pattern.as_str(),
                        error = %err,
                        "failed to start consumer"
                    );
                }
            });
        }
        info!(%id, pattern, "subscribed");

        let shared = Arc::downgrade(&self.shared);
        Ok(Subscription::new(id, pattern, move || {
            if let Some(shared) = shared.upgrade() {
                shared.unsubscribe(id);
            }
        }))
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        let shared = Arc::clone(&self.shared);
        async move { shared.shutdown().await }
    }
}
