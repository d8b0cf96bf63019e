//! lapin implementation of the broker port.

use std::future::ready;

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, warn};

use courier_app::BrokerError;
use courier_app::ports::{
    Broker, BrokerChannel, BrokerConnection, Consumer, Delivery, LossNotifier, LossSignal,
    MessageProperties, loss_channel,
};

use crate::config::AmqpConfig;
use crate::error::LapinError;

const REPLY_SUCCESS: u16 = 200;
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const PERSISTENT: u8 = 2;

fn amqp(operation: &'static str, err: lapin::Error) -> BrokerError {
    BrokerError::new(operation, LapinError::from(err))
}

/// Connects to an AMQP 0-9-1 broker.
#[derive(Debug, Clone)]
pub struct LapinBroker {
    config: AmqpConfig,
}

impl LapinBroker {
    #[must_use]
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }
}

impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn connect(&self) -> Result<LapinConnection, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.connection_name.clone()));
        let connection = Connection::connect(&self.config.url, properties)
            .await
            .map_err(|err| amqp("connect", err))?;

        let (notifier, signal) = loss_channel();
        let on_error = notifier.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            on_error.notify(err.to_string());
        });
        debug!(name = self.config.connection_name, "AMQP connection opened");

        Ok(LapinConnection {
            connection,
            notifier,
            signal,
        })
    }
}

/// An open AMQP connection.
pub struct LapinConnection {
    connection: Connection,
    notifier: LossNotifier,
    signal: LossSignal,
}

impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self, confirms: bool) -> Result<LapinChannel, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| amqp("open channel", err))?;
        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| amqp("confirm select", err))?;
        }

        // Channel failures are only observable through failed operations;
        // connection failures take every channel down with them.
        let (notifier, signal) = loss_channel();
        Ok(LapinChannel {
            channel,
            notifier,
            signal,
            connection: self.notifier.clone(),
        })
    }

    fn loss_signal(&self) -> LossSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| amqp("close connection", err))
    }
}

/// An AMQP channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: lapin::Channel,
    notifier: LossNotifier,
    signal: LossSignal,
    connection: LossNotifier,
}

impl LapinChannel {
    /// Convert a failed operation, reporting the channel lost if it is no
    /// longer usable.
    fn fail(&self, operation: &'static str, err: lapin::Error) -> BrokerError {
        if !self.channel.status().connected() && !self.connection.is_lost() {
            self.notifier.notify(format!("{operation}: {err}"));
        }
        amqp(operation, err)
    }
}

impl BrokerChannel for LapinChannel {
    type Delivery = LapinDelivery;

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|err| self.fail("declare exchange", err))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| self.fail("set prefetch", err))
    }

    async fn declare_subscriber_queue(
        &self,
        dead_letter_exchange: &str,
    ) -> Result<String, BrokerError> {
        let options = QueueDeclareOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let mut arguments = FieldTable::default();
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(dead_letter_exchange.into()),
        );
        let queue = self
            .channel
            .queue_declare("", options, arguments)
            .await
            .map_err(|err| self.fail("declare queue", err))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.fail("bind queue", err))
    }

    async fn consume(&self, queue: &str) -> Result<Consumer<LapinDelivery>, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.fail("consume", err))?;
        let tag = consumer.tag().as_str().to_string();

        let notifier = self.notifier.clone();
        let deliveries = consumer
            .take_while(move |item| {
                if let Err(err) = item {
                    debug!(error = %err, "consumer stream failed");
                    notifier.notify(format!("consumer: {err}"));
                }
                ready(item.is_ok())
            })
            .filter_map(|item| ready(item.ok().map(LapinDelivery)))
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if properties.persistent { PERSISTENT } else { 1 })
            .with_content_type(properties.content_type.into())
            .with_message_id(properties.message_id.into())
            .with_timestamp(properties.timestamp);
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|err| self.fail("publish", err))?;
        match confirm.await.map_err(|err| self.fail("publish confirm", err))? {
            Confirmation::Nack(_) => Err(BrokerError::new(
                "publish",
                LapinError::Nacked {
                    exchange: exchange.to_string(),
                },
            )),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| self.fail("cancel", err))
    }

    fn loss_signal(&self) -> LossSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|err| amqp("close channel", err))
    }
}

/// A message received from a queue.
pub struct LapinDelivery(lapin::message::Delivery);

impl Delivery for LapinDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    async fn ack(self) -> Result<(), BrokerError> {
        self.0
            .acker
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .map_err(|err| amqp("ack", err))
    }

    async fn reject(self) -> Result<(), BrokerError> {
        self.0
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| amqp("reject", err))
    }
}
