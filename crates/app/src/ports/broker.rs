//! Broker port — the slice of a topic-exchange message broker the durable
//! bus needs.
//!
//! The model follows AMQP 0-9-1: a [`Broker`] opens [`BrokerConnection`]s,
//! a connection opens confirm-mode [`BrokerChannel`]s, and a channel declares
//! exchanges and queues, publishes, and consumes [`Delivery`]s.
//!
//! Handles are replaced wholesale on reconnection and never mutated in
//! place, so every async operation can capture the handle it started with.

use std::future::Future;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::error::BrokerError;

/// Properties attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Survive broker restarts (delivery mode 2).
    pub persistent: bool,
    pub content_type: String,
    pub message_id: String,
    /// Whole seconds since the Unix epoch.
    pub timestamp: u64,
}

/// An active consumer: its broker-assigned tag and the stream of deliveries.
pub struct Consumer<D> {
    pub tag: String,
    pub deliveries: BoxStream<'static, D>,
}

/// An inbound message awaiting settlement.
pub trait Delivery: Send + 'static {
    /// Raw message body.
    fn body(&self) -> &[u8];

    /// Positively acknowledge the message.
    fn ack(self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Negatively acknowledge without requeue, routing the message to the
    /// queue's dead-letter exchange.
    fn reject(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Entry point of a broker adapter.
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, BrokerError>> + Send;
}

/// A live connection to the broker.
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a channel, in publisher-confirm mode when `confirms` is set.
    fn open_channel(
        &self,
        confirms: bool,
    ) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// Signal that fires if the connection terminates without [`close`](Self::close).
    fn loss_signal(&self) -> LossSignal;

    /// Close the connection.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A channel multiplexed over a connection.
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    type Delivery: Delivery;

    /// Declare a durable topic exchange.
    fn declare_exchange(&self, name: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Limit unacknowledged deliveries per consumer.
    fn set_prefetch(&self, count: u16) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Declare a server-named, exclusive, auto-delete, non-durable queue that
    /// dead-letters rejected messages to `dead_letter_exchange`. Returns the
    /// queue name.
    fn declare_subscriber_queue(
        &self,
        dead_letter_exchange: &str,
    ) -> impl Future<Output = Result<String, BrokerError>> + Send;

    /// Bind `queue` to `exchange` with a topic `pattern`.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Start consuming from `queue`.
    fn consume(
        &self,
        queue: &str,
    ) -> impl Future<Output = Result<Consumer<Self::Delivery>, BrokerError>> + Send;

    /// Publish a message and wait for the broker's confirm.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Cancel a consumer by tag.
    fn cancel(&self, consumer_tag: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Signal that fires if the channel terminates without [`close`](Self::close).
    fn loss_signal(&self) -> LossSignal;

    /// Close the channel.
    fn close(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Adapter-side half of a loss notification.
#[derive(Debug, Clone)]
pub struct LossNotifier {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl LossNotifier {
    /// Report an unexpected termination. Only the first report is kept.
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Whether a loss has already been reported.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Bus-side half of a loss notification.
#[derive(Debug, Clone)]
pub struct LossSignal {
    rx: watch::Receiver<Option<String>>,
}

impl LossSignal {
    /// Wait for an unexpected termination and return its reason.
    ///
    /// Never resolves if the notifier is dropped without reporting a loss,
    /// which is what an orderly close looks like.
    pub async fn lost(mut self) -> String {
        let reason = match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

/// Create a connected notifier/signal pair.
#[must_use]
pub fn loss_channel() -> (LossNotifier, LossSignal) {
    let (tx, rx) = watch::channel(None);
    (LossNotifier { tx: Arc::new(tx) }, LossSignal { rx })
}
