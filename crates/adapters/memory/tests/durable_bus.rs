//! Durable bus against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use courier_adapter_memory::MemoryBroker;
use courier_app::correlation;
use courier_app::ports::{EventBus, Handler, HandlerError, Subscription, handler_fn};
use courier_app::{BusError, ConnectionState, DurableBusConfig, DurableEventBus};
use courier_domain::DomainEvent;

fn config() -> DurableBusConfig {
    let mut config = DurableBusConfig::default();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 40;
    config
}

fn event(event_type: &str) -> DomainEvent {
    DomainEvent::new(event_type, json!({ "type": event_type })).unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

type Received = Arc<Mutex<Vec<DomainEvent>>>;

fn recorder() -> (Handler, Received) {
    let received: Received = Arc::default();
    let sink = Arc::clone(&received);
    let handler = handler_fn(move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    });
    (handler, received)
}

/// Tracks how many handler calls are running at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

fn slow_handler(gauge: &Arc<Gauge>, pause: Duration) -> Handler {
    let gauge = Arc::clone(gauge);
    handler_fn(move |_| {
        let gauge = Arc::clone(&gauge);
        async move {
            let running = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(pause).await;
            gauge.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn routing_keys(broker: &MemoryBroker) -> Vec<String> {
    broker
        .published()
        .into_iter()
        .map(|m| m.routing_key)
        .collect()
}

async fn connected(broker: &MemoryBroker, config: DurableBusConfig) -> DurableEventBus<MemoryBroker> {
    DurableEventBus::connect(broker.clone(), config).await.unwrap()
}

/// Drop the link and keep the broker down until `broker.set_refusing(false)`.
async fn take_down(broker: &MemoryBroker, bus: &DurableEventBus<MemoryBroker>) {
    broker.set_refusing(true);
    broker.sever("network unreachable");
    eventually("reconnecting state", || {
        bus.state() == ConnectionState::Reconnecting
    })
    .await;
}

#[tokio::test]
async fn should_declare_topology_on_connect() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;

    assert_eq!(bus.state(), ConnectionState::Connected);
    assert!(broker.has_exchange("events"));
    assert!(broker.has_exchange("dlx"));
    assert_eq!(broker.prefetch(), Some(10));
    assert_eq!(broker.confirm_mode(), Some(true));
}

#[tokio::test]
async fn should_fail_to_connect_when_broker_refuses() {
    let broker = MemoryBroker::new();
    broker.set_refusing(true);

    let result = DurableEventBus::connect(broker, config()).await;

    assert!(matches!(result, Err(BusError::Broker(_))));
}

#[tokio::test]
async fn should_publish_persistent_json_routed_by_type() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let sent = event("order.placed");

    let reply = bus.publish(sent.clone()).await.unwrap();

    assert!(reply.is_none());
    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, "events");
    assert_eq!(message.routing_key, "order.placed");
    assert!(message.properties.persistent);
    assert_eq!(message.properties.content_type, "application/json");
    assert_eq!(message.properties.message_id, sent.id());
    assert_eq!(
        message.properties.timestamp,
        u64::try_from(sent.timestamp().timestamp()).unwrap()
    );
    let body: Value = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(body["type"], "order.placed");
    assert_eq!(body["metadata"]["version"], 1);
}

#[tokio::test]
async fn should_deliver_to_matching_subscriptions_and_ack() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let (handler, received) = recorder();
    bus.subscribe("order.#", handler).unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    let sent = event("order.placed");
    bus.publish(sent.clone()).await.unwrap();
    bus.publish(event("user.created")).await.unwrap();

    eventually("delivery", || received.lock().unwrap().len() == 1).await;
    eventually("ack", || broker.acked() == 1).await;
    let got = received.lock().unwrap()[0].clone();
    assert_eq!(got.id(), sent.id());
    assert_eq!(got.event_type(), "order.placed");
    assert_eq!(got.payload(), sent.payload());
}

#[tokio::test]
async fn should_run_handler_in_event_correlation_scope() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    bus.subscribe(
        "#",
        handler_fn(move |_| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(correlation::current());
                Ok(())
            }
        }),
    )
    .unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    bus.publish(event("order.placed").with_correlation_id("corr-7"))
        .await
        .unwrap();

    eventually("delivery", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0].as_deref(), Some("corr-7"));
}

#[tokio::test]
async fn should_dead_letter_when_handler_fails() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    bus.subscribe(
        "order.*",
        handler_fn(|_| async { Err::<(), HandlerError>("out of stock".into()) }),
    )
    .unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    bus.publish(event("order.placed")).await.unwrap();

    eventually("dead letter", || broker.dead_letters().len() == 1).await;
    let dead = &broker.dead_letters()[0];
    assert_eq!(dead.exchange, "dlx");
    assert_eq!(dead.routing_key, "order.placed");
    assert_eq!(broker.acked(), 0);
}

#[tokio::test]
async fn should_dead_letter_when_handler_panics() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    bus.subscribe(
        "#",
        handler_fn(|_| async { panic!("handler bug") }),
    )
    .unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    bus.publish(event("order.placed")).await.unwrap();

    eventually("dead letter", || broker.dead_letters().len() == 1).await;
}

#[tokio::test]
async fn should_dead_letter_invalid_message_without_calling_handler() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let (handler, received) = recorder();
    bus.subscribe("#", handler).unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    broker.inject("events", "order.placed", "not json");
    broker.inject("events", "order.placed", r#"{"id":"x","type":"","timestamp":"t"}"#);

    eventually("dead letters", || broker.dead_letters().len() == 2).await;
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn should_stop_delivery_after_unsubscribe() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let (handler, received) = recorder();
    let subscription = bus.subscribe("#", handler).unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;
    assert!(bus.consumer_tag(subscription.id()).is_some());

    subscription.unsubscribe();
    subscription.unsubscribe();

    assert_eq!(bus.active_subscriptions(), 0);
    eventually("cancel", || broker.queue_count() == 0).await;
    bus.publish(event("order.placed")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn should_run_handlers_concurrently_up_to_prefetch() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let gauge = Arc::new(Gauge::default());
    bus.subscribe("#", slow_handler(&gauge, Duration::from_millis(50)))
        .unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    for _ in 0..5 {
        bus.publish(event("order.placed")).await.unwrap();
    }

    eventually("acks", || broker.acked() == 5).await;
    assert!(gauge.peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn should_handle_one_delivery_at_a_time_with_prefetch_one() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.prefetch = 1;
    let bus = connected(&broker, config).await;
    let gauge = Arc::new(Gauge::default());
    bus.subscribe("#", slow_handler(&gauge, Duration::from_millis(10)))
        .unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    for _ in 0..3 {
        bus.publish(event("order.placed")).await.unwrap();
    }

    eventually("acks", || broker.acked() == 3).await;
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn should_dead_letter_deliveries_that_arrive_after_unsubscribe() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.prefetch = 1;
    let bus = connected(&broker, config).await;
    let received: Received = Arc::default();
    let handle: Arc<Mutex<Option<Subscription>>> = Arc::default();

    let sink = Arc::clone(&received);
    let own = Arc::clone(&handle);
    let subscription = bus
        .subscribe(
            "order.#",
            handler_fn(move |event| {
                let sink = Arc::clone(&sink);
                let own = Arc::clone(&own);
                async move {
                    sink.lock().unwrap().push(event);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    if let Some(subscription) = own.lock().unwrap().as_ref() {
                        subscription.unsubscribe();
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();
    *handle.lock().unwrap() = Some(subscription);
    eventually("consumer", || broker.consumer_count() == 1).await;

    bus.publish(event("order.placed")).await.unwrap();
    eventually("first delivery", || received.lock().unwrap().len() == 1).await;
    bus.publish(event("order.cancelled")).await.unwrap();

    eventually("dead letter", || broker.dead_letters().len() == 1).await;
    assert_eq!(broker.dead_letters()[0].routing_key, "order.cancelled");
    assert_eq!(received.lock().unwrap().len(), 1);
    assert_eq!(broker.acked(), 1);
    assert_eq!(bus.active_subscriptions(), 0);
}

#[tokio::test]
async fn should_buffer_while_reconnecting_and_flush_in_order() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    bus.publish(event("before.loss")).await.unwrap();
    take_down(&broker, &bus).await;

    let first = bus.publish(event("buffered.first"));
    let second = bus.publish(event("buffered.second"));
    let third = bus.publish(event("buffered.third"));
    assert_eq!(bus.buffered(), 3);

    broker.set_confirm_delay(Some(Duration::from_millis(30)));
    broker.set_refusing(false);
    let during_flush = async {
        eventually("new connection", || broker.connects() == 2).await;
        assert_eq!(bus.state(), ConnectionState::Reconnecting);
        bus.publish(event("during.flush")).await
    };
    let (first, second, third, during) = tokio::join!(first, second, third, during_flush);
    first.unwrap();
    second.unwrap();
    third.unwrap();
    during.unwrap();

    broker.set_confirm_delay(None);
    bus.publish(event("after.reconnect")).await.unwrap();

    assert_eq!(bus.state(), ConnectionState::Connected);
    assert_eq!(bus.buffered(), 0);
    assert_eq!(broker.connects(), 2);
    assert_eq!(
        routing_keys(&broker),
        [
            "before.loss",
            "buffered.first",
            "buffered.second",
            "buffered.third",
            "during.flush",
            "after.reconnect"
        ]
    );
}

#[tokio::test]
async fn should_refuse_publish_when_buffer_is_full() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.reconnect.buffer_capacity = 2;
    let bus = connected(&broker, config).await;
    take_down(&broker, &bus).await;

    let first = bus.publish(event("a"));
    let second = bus.publish(event("b"));
    let overflow = bus.publish(event("c")).await;

    assert!(matches!(overflow, Err(BusError::BufferFull { capacity: 2 })));
    broker.set_refusing(false);
    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(routing_keys(&broker), ["a", "b"]);
}

#[tokio::test]
async fn should_close_after_exhausting_reconnect_attempts() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.reconnect.initial_delay_ms = 50;
    config.reconnect.max_delay_ms = 50;
    config.reconnect.max_attempts = 2;
    let bus = connected(&broker, config).await;
    take_down(&broker, &bus).await;

    let stranded = bus.publish(event("stranded")).await;

    assert!(matches!(
        stranded,
        Err(BusError::ReconnectExhausted { attempts: 2 })
    ));
    assert_eq!(bus.state(), ConnectionState::Closed);
    assert!(matches!(
        bus.publish(event("late")).await,
        Err(BusError::Closed)
    ));
    let (handler, _) = recorder();
    assert!(matches!(bus.subscribe("#", handler), Err(BusError::Closed)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn should_stop_reconnecting_once_bus_is_dropped() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    take_down(&broker, &bus).await;

    drop(bus);
    broker.set_refusing(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.connects(), 1);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn should_close_on_loss_when_reconnect_is_disabled() {
    let broker = MemoryBroker::new();
    let mut config = config();
    config.reconnect.enabled = false;
    let bus = connected(&broker, config).await;

    broker.sever("broker restarted");

    eventually("closed state", || bus.state() == ConnectionState::Closed).await;
    assert!(matches!(
        bus.publish(event("a")).await,
        Err(BusError::Closed)
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn should_restore_consumers_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let (handler, received) = recorder();
    bus.subscribe("order.#", handler).unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    broker.sever("connection reset");
    eventually("restored consumer", || {
        bus.state() == ConnectionState::Connected
            && broker.connects() == 2
            && broker.consumer_count() == 1
    })
    .await;

    bus.publish(event("order.shipped")).await.unwrap();
    eventually("delivery", || received.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn should_attach_consumer_for_subscription_made_while_reconnecting() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    take_down(&broker, &bus).await;

    let (handler, received) = recorder();
    bus.subscribe("user.*", handler).unwrap();
    assert_eq!(broker.consumer_count(), 0);

    broker.set_refusing(false);
    eventually("consumer", || {
        bus.state() == ConnectionState::Connected && broker.consumer_count() == 1
    })
    .await;
    bus.publish(event("user.created")).await.unwrap();
    eventually("delivery", || received.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn should_reconnect_after_channel_failure() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;

    broker.fail_channels("precondition failed");

    eventually("new link", || {
        bus.state() == ConnectionState::Connected && broker.connects() == 2
    })
    .await;
    eventually("old connection closed", || broker.open_connections() == 1).await;
    bus.publish(event("a.b")).await.unwrap();
    assert_eq!(routing_keys(&broker), ["a.b"]);
}

#[tokio::test]
async fn should_fail_direct_publish_on_nack() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    broker.set_nacking(true);

    let result = bus.publish(event("a.b")).await;

    assert!(matches!(result, Err(BusError::Broker(_))));
    assert_eq!(bus.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn should_release_everything_on_shutdown() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    let (handler, _) = recorder();
    bus.subscribe("#", handler).unwrap();
    eventually("consumer", || broker.consumer_count() == 1).await;

    bus.shutdown().await;
    bus.shutdown().await;

    assert_eq!(bus.state(), ConnectionState::Closed);
    assert_eq!(bus.active_subscriptions(), 0);
    assert_eq!(broker.queue_count(), 0);
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(
        bus.publish(event("a")).await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn should_reject_buffered_publishes_on_shutdown() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;
    take_down(&broker, &bus).await;

    let pending = bus.publish(event("a"));
    bus.shutdown().await;

    assert!(matches!(pending.await, Err(BusError::Closed)));
    broker.set_refusing(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.connects(), 1);
    assert_eq!(bus.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn should_ignore_loss_after_shutdown() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker, config()).await;

    bus.shutdown().await;
    broker.sever("late");
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(bus.state(), ConnectionState::Closed);
    assert_eq!(broker.connects(), 1);
}
