//! In-memory topic broker.
//!
//! Models the parts of an AMQP 0-9-1 broker the durable bus relies on:
//! topic exchanges with `*`/`#` routing, exclusive auto-delete queues owned
//! by a connection, dead-lettering on reject, and publisher confirms (every
//! publish is confirmed unless the broker is told to nack).
//!
//! The broker also exposes fault injection: severing every connection,
//! failing channels, refusing new connections, and nacking or slowing down
//! publishes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use courier_app::BrokerError;
use courier_app::ports::{
    Broker, BrokerChannel, BrokerConnection, Consumer, Delivery, LossNotifier, LossSignal,
    MessageProperties, loss_channel,
};
use courier_domain::topic::TopicPattern;

use crate::error::MemoryBrokerError;

/// A message as the broker saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct QueueState {
    owner: u64,
    dead_letter_exchange: String,
    bindings: Vec<(String, TopicPattern)>,
    consumer: Option<(String, mpsc::UnboundedSender<MemoryDelivery>)>,
    backlog: VecDeque<PublishedMessage>,
}

struct ConnectionEntry {
    notifier: LossNotifier,
    channels: HashMap<u64, LossNotifier>,
}

#[derive(Default)]
struct Inner {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionEntry>,
    next_id: u64,
    refusing: bool,
    nacking: bool,
    confirm_delay: Option<Duration>,
    connects: usize,
    prefetch: Option<u16>,
    confirm_mode: Option<bool>,
    published: Vec<PublishedMessage>,
    dead_letters: Vec<PublishedMessage>,
    acked: usize,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, connection: u64, channel: u64) -> Result<(), MemoryBrokerError> {
        let entry = self
            .connections
            .get(&connection)
            .ok_or(MemoryBrokerError::ConnectionClosed)?;
        if entry.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(MemoryBrokerError::ChannelClosed)
        }
    }

    /// Route a message to every queue bound to its exchange with a matching
    /// pattern. Returns the number of queues it reached.
    fn route(&mut self, inner: &Arc<Mutex<Self>>, message: &PublishedMessage) -> usize {
        let mut reached = 0;
        for queue in self.queues.values_mut() {
            let bound = queue.bindings.iter().any(|(exchange, pattern)| {
                exchange == &message.exchange && pattern.matches(&message.routing_key)
            });
            if bound {
                queue.enqueue(inner, message.clone());
                reached += 1;
            }
        }
        reached
    }

    fn drop_connection(&mut self, id: u64) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        self.queues.retain(|_, queue| queue.owner != id);
        Some(entry)
    }
}

impl QueueState {
    fn enqueue(&mut self, inner: &Arc<Mutex<Inner>>, message: PublishedMessage) {
        if let Some((_, consumer)) = &self.consumer {
            let delivery = MemoryDelivery {
                message,
                dead_letter_exchange: self.dead_letter_exchange.clone(),
                inner: Arc::clone(inner),
            };
            if let Err(mpsc::error::SendError(delivery)) = consumer.send(delivery) {
                self.backlog.push_back(delivery.message);
            }
        } else {
            self.backlog.push_back(message);
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to an in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        lock(&self.inner).refusing = refusing;
    }

    /// Nack (or confirm again) every publish.
    pub fn set_nacking(&self, nacking: bool) {
        lock(&self.inner).nacking = nacking;
    }

    /// Hold every publish for `delay` before it is routed and confirmed.
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        lock(&self.inner).confirm_delay = delay;
    }

    /// Drop every connection as if the network went away, reporting `reason`
    /// to their loss signals.
    pub fn sever(&self, reason: &str) {
        let mut inner = lock(&self.inner);
        let ids: Vec<u64> = inner.connections.keys().copied().collect();
        for id in ids {
            if let Some(entry) = inner.drop_connection(id) {
                entry.notifier.notify(reason);
                for channel in entry.channels.values() {
                    channel.notify(reason);
                }
            }
        }
        debug!(reason, "severed all connections");
    }

    /// Fail every open channel, leaving connections up.
    pub fn fail_channels(&self, reason: &str) {
        let mut inner = lock(&self.inner);
        for entry in inner.connections.values_mut() {
            for (_, channel) in entry.channels.drain() {
                channel.notify(reason);
            }
        }
    }

    /// Publish raw bytes straight onto an exchange, bypassing any client.
    /// Returns how many queues received a copy.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> usize {
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.into(),
            properties: MessageProperties {
                persistent: false,
                content_type: "application/octet-stream".to_string(),
                message_id: String::new(),
                timestamp: 0,
            },
        };
        let mut inner = lock(&self.inner);
        inner.route(&self.inner, &message)
    }

    /// Every message accepted by a publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner).published.clone()
    }

    /// Every message rejected by a consumer, as forwarded to its
    /// dead-letter exchange.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<PublishedMessage> {
        lock(&self.inner).dead_letters.clone()
    }

    #[must_use]
    pub fn acked(&self) -> usize {
        lock(&self.inner).acked
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        lock(&self.inner).connects
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        lock(&self.inner).connections.len()
    }

    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.inner).exchanges.contains(name)
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        lock(&self.inner).queues.len()
    }

    /// Queues with an attached consumer.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        lock(&self.inner)
            .queues
            .values()
            .filter(|q| q.consumer.is_some())
            .count()
    }

    /// Last prefetch count a channel asked for.
    #[must_use]
    pub fn prefetch(&self) -> Option<u16> {
        lock(&self.inner).prefetch
    }

    /// Whether the last channel was opened in confirm mode.
    #[must_use]
    pub fn confirm_mode(&self) -> Option<bool> {
        lock(&self.inner).confirm_mode
    }
}

impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BrokerError> {
        let mut inner = lock(&self.inner);
        if inner.refusing {
            return Err(BrokerError::new("connect", MemoryBrokerError::Refused));
        }
        let id = inner.next_id();
        let (notifier, signal) = loss_channel();
        inner.connections.insert(
            id,
            ConnectionEntry {
                notifier,
                channels: HashMap::new(),
            },
        );
        inner.connects += 1;
        debug!(connection = id, "connection opened");
        Ok(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
            signal,
        })
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    inner: Arc<Mutex<Inner>>,
    signal: LossSignal,
}

impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self, confirms: bool) -> Result<MemoryChannel, BrokerError> {
        let mut inner = lock(&self.inner);
        let id = inner.next_id();
        let (notifier, signal) = loss_channel();
        let entry = inner.connections.get_mut(&self.id).ok_or_else(|| {
            BrokerError::new("open channel", MemoryBrokerError::ConnectionClosed)
        })?;
        entry.channels.insert(id, notifier);
        inner.confirm_mode = Some(confirms);
        Ok(MemoryChannel {
            connection: self.id,
            id,
            inner: Arc::clone(&self.inner),
            signal,
        })
    }

    fn loss_signal(&self) -> LossSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if lock(&self.inner).drop_connection(self.id).is_some() {
            debug!(connection = self.id, "connection closed");
        }
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
#[derive(Clone)]
pub struct MemoryChannel {
    connection: u64,
    id: u64,
    inner: Arc<Mutex<Inner>>,
    signal: LossSignal,
}

impl MemoryChannel {
    fn open(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        let inner = lock(&self.inner);
        inner
            .check_channel(self.connection, self.id)
            .map_err(|err| BrokerError::new(operation, err))?;
        Ok(inner)
    }
}

impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.open("declare exchange")?
            .exchanges
            .insert(name.to_string());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.open("set prefetch")?.prefetch = Some(count);
        Ok(())
    }

    async fn declare_subscriber_queue(
        &self,
        dead_letter_exchange: &str,
    ) -> Result<String, BrokerError> {
        let mut inner = self.open("declare queue")?;
        let name = format!("amq.gen-{}", inner.next_id());
        inner.queues.insert(
            name.clone(),
            QueueState {
                owner: self.connection,
                dead_letter_exchange: dead_letter_exchange.to_string(),
                bindings: Vec::new(),
                consumer: None,
                backlog: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        const OPERATION: &str = "bind queue";
        let compiled =
            TopicPattern::compile(pattern).map_err(|err| BrokerError::new(OPERATION, err))?;
        let mut inner = self.open(OPERATION)?;
        if !inner.exchanges.contains(exchange) {
            return Err(BrokerError::new(
                OPERATION,
                MemoryBrokerError::UnknownExchange(exchange.to_string()),
            ));
        }
        let state = inner.queues.get_mut(queue).ok_or_else(|| {
            BrokerError::new(OPERATION, MemoryBrokerError::UnknownQueue(queue.to_string()))
        })?;
        state.bindings.push((exchange.to_string(), compiled));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer<MemoryDelivery>, BrokerError> {
        const OPERATION: &str = "consume";
        let mut inner = self.open(OPERATION)?;
        let tag = format!("ctag-{}", inner.next_id());
        let state = inner.queues.get_mut(queue).ok_or_else(|| {
            BrokerError::new(OPERATION, MemoryBrokerError::UnknownQueue(queue.to_string()))
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.consumer = Some((tag.clone(), tx));
        let backlog: Vec<PublishedMessage> = state.backlog.drain(..).collect();
        for message in backlog {
            state.enqueue(&self.inner, message);
        }
        Ok(Consumer {
            tag,
            deliveries: UnboundedReceiverStream::new(rx).boxed(),
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        const OPERATION: &str = "publish";
        let delay = self.open(OPERATION)?.confirm_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.open(OPERATION)?;
        if inner.nacking {
            return Err(BrokerError::new(
                OPERATION,
                MemoryBrokerError::Nacked {
                    exchange: exchange.to_string(),
                },
            ));
        }
        if !inner.exchanges.contains(exchange) {
            return Err(BrokerError::new(
                OPERATION,
                MemoryBrokerError::UnknownExchange(exchange.to_string()),
            ));
        }
        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
        };
        let reached = inner.route(&self.inner, &message);
        debug!(exchange, routing_key, reached, "routed");
        inner.published.push(message);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        const OPERATION: &str = "cancel";
        let mut inner = self.open(OPERATION)?;
        let queue = inner
            .queues
            .iter()
            .find(|(_, q)| matches!(&q.consumer, Some((tag, _)) if tag == consumer_tag))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                BrokerError::new(
                    OPERATION,
                    MemoryBrokerError::UnknownConsumer(consumer_tag.to_string()),
                )
            })?;
        // auto-delete: the queue goes with its only consumer
        inner.queues.remove(&queue);
        Ok(())
    }

    fn loss_signal(&self) -> LossSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.connections.get_mut(&self.connection) {
            entry.channels.remove(&self.id);
        }
        Ok(())
    }
}

/// A message handed to a consumer.
pub struct MemoryDelivery {
    message: PublishedMessage,
    dead_letter_exchange: String,
    inner: Arc<Mutex<Inner>>,
}

impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    async fn ack(self) -> Result<(), BrokerError> {
        lock(&self.inner).acked += 1;
        Ok(())
    }

    async fn reject(self) -> Result<(), BrokerError> {
        let dead = PublishedMessage {
            exchange: self.dead_letter_exchange,
            ..self.message
        };
        let mut inner = lock(&self.inner);
        if inner.exchanges.contains(&dead.exchange) {
            inner.route(&self.inner, &dead);
        }
        inner.dead_letters.push(dead);
        Ok(())
    }
}
