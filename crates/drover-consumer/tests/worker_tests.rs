//! End-to-end worker scenarios against the in-memory broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use drover_common::{
    ConnectionBinding, ConnectionSpec, ConsumerGroupSpec, Delivery, Disposition, ProcessingError,
    WorkerState, WorkerStatus,
};
use drover_consumer::connection::{BackoffPolicy, ConnectionManager};
use drover_consumer::handler::{ConsumerRegistry, MessageConsumer};
use drover_consumer::testing::{
    delivery, redelivery, BrokerEvent, MockBroker, RecordingStatsSink, ScriptItem,
    ScriptedConsumer,
};
use drover_consumer::worker::{ConsumerWorker, StopMode, WorkerOptions};

fn connection_specs() -> HashMap<String, Arc<ConnectionSpec>> {
    HashMap::from([("main".to_string(), Arc::new(ConnectionSpec::default()))])
}

fn group_spec(max_errors: Option<u32>) -> ConsumerGroupSpec {
    ConsumerGroupSpec {
        name: "orders".to_string(),
        consumer: "scripted".to_string(),
        connections: vec![ConnectionBinding::consume_only("main")],
        qty: 1,
        queue: "orders".to_string(),
        ack: true,
        max_errors,
        error_window_secs: 60,
        error_exchange: None,
        qos_prefetch: 5,
        measurement: None,
        config: serde_json::Value::Null,
    }
}

struct Harness {
    stats: Arc<RecordingStatsSink>,
    stop: broadcast::Sender<StopMode>,
    status: watch::Receiver<WorkerStatus>,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(
        broker: Arc<MockBroker>,
        spec: ConsumerGroupSpec,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Self {
        let mut registry = ConsumerRegistry::new();
        registry.register("scripted", consumer);
        let (stop, shutdown) = broadcast::channel(4);
        let stats = RecordingStatsSink::new();
        let options = WorkerOptions {
            max_connect_attempts: 3,
            backoff: BackoffPolicy::constant(Duration::from_millis(5)),
        };
        let (worker, status) = ConsumerWorker::new(
            "orders-0",
            Arc::new(spec),
            connection_specs(),
            Arc::new(registry),
            broker.clone(),
            stats.clone(),
            options,
            shutdown,
        );
        let handle = tokio::spawn(worker.run());
        Self {
            stats,
            stop,
            status,
            handle,
        }
    }

    async fn wait_for(&mut self, f: impl FnMut(&WorkerStatus) -> bool) -> WorkerStatus {
        timeout(Duration::from_secs(5), self.status.wait_for(f))
            .await
            .expect("status condition not reached")
            .expect("status channel closed")
            .clone()
    }

    async fn stop_and_join(self, mode: StopMode) -> WorkerStatus {
        let _ = self.stop.send(mode);
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");
        self.status.borrow().clone()
    }
}

#[tokio::test]
async fn acks_deliveries_in_receipt_order() {
    let broker = MockBroker::new();
    broker.push_batch(
        "main",
        vec![
            ScriptItem::Deliver(delivery(1)),
            ScriptItem::Deliver(delivery(2)),
        ],
    );
    let mut harness = Harness::start(broker.clone(), group_spec(None), ScriptedConsumer::new());

    harness.wait_for(|s| s.processed == 2).await;
    let status = harness.stop_and_join(StopMode::Graceful).await;

    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.processed, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(broker.acked_tags(), vec![1, 2]);
    assert!(broker
        .events()
        .contains(&BrokerEvent::ConnectionClosed {
            connection: "main".to_string()
        }));
}

#[tokio::test]
async fn error_threshold_restarts_and_rearms() {
    // Three failing deliveries with max_errors = 2: the second failure trips
    // the threshold, so the third is never processed on that session.
    let broker = MockBroker::new();
    broker.push_batch(
        "main",
        vec![
            ScriptItem::Deliver(delivery(1)),
            ScriptItem::Deliver(delivery(2)),
            ScriptItem::Deliver(delivery(3)),
        ],
    );
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(4))]);

    let consumer = ScriptedConsumer::new();
    consumer.push(Err(ProcessingError::Recoverable("bad payload".to_string())));
    consumer.push(Err(ProcessingError::Recoverable("bad payload".to_string())));

    let mut harness = Harness::start(broker.clone(), group_spec(Some(2)), consumer.clone());

    let status = harness
        .wait_for(|s| s.restarts == 1 && s.processed == 1)
        .await;
    assert_eq!(status.failed, 2);
    assert_eq!(consumer.processed_tags(), vec![1, 2, 4]);
    assert_eq!(broker.connects("main"), 2);
    // No error exchange: failures are requeued.
    assert_eq!(
        broker.nacks(),
        vec![(1, true, false), (2, true, false)]
    );
    assert_eq!(harness.stats.incr_count("orders", "failed"), 2);
    assert_eq!(harness.stats.incr_count("orders", "reconnected"), 1);

    harness.stop_and_join(StopMode::Graceful).await;
}

#[tokio::test]
async fn applies_group_prefetch_to_consume_channels() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);
    let mut harness = Harness::start(broker.clone(), group_spec(None), ScriptedConsumer::new());

    harness.wait_for(|s| s.processed == 1).await;
    harness.stop_and_join(StopMode::Graceful).await;

    // The group's qos_prefetch rides on the consume channel, bounding how
    // many deliveries the broker pushes ahead of acknowledgements.
    assert!(broker.events().contains(&BrokerEvent::ChannelOpened {
        connection: "main".to_string(),
        prefetch: 5,
        confirm_mode: false,
    }));
}

#[tokio::test]
async fn error_exchange_rejects_without_requeue() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);

    let consumer = ScriptedConsumer::new();
    consumer.push(Err(ProcessingError::Recoverable("nope".to_string())));

    let mut spec = group_spec(None);
    spec.error_exchange = Some("dlx".to_string());
    let mut harness = Harness::start(broker.clone(), spec, consumer);

    harness.wait_for(|s| s.failed == 1).await;
    assert_eq!(harness.stats.incr_count("orders", "rejected_messages"), 1);
    assert_eq!(harness.stats.incr_count("orders", "requeued_messages"), 0);
    harness.stop_and_join(StopMode::Graceful).await;

    assert_eq!(broker.nacks(), vec![(1, false, false)]);
}

#[tokio::test]
async fn auto_ack_mode_still_counts_failures() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);
    broker.push_batch("main", vec![]);

    let consumer = ScriptedConsumer::new();
    consumer.push(Err(ProcessingError::Recoverable("bad".to_string())));

    let mut spec = group_spec(Some(1));
    spec.ack = false;
    let mut harness = Harness::start(broker.clone(), spec, consumer);

    let status = harness.wait_for(|s| s.restarts == 1).await;
    assert_eq!(status.failed, 1);
    assert_eq!(broker.connects("main"), 2);
    // Fire-and-forget: the worker never settles deliveries itself, and the
    // rejection counters only move when a nack is actually sent.
    assert!(broker.acked_tags().is_empty());
    assert!(broker.nacks().is_empty());
    assert_eq!(harness.stats.incr_count("orders", "failed"), 1);
    assert_eq!(harness.stats.incr_count("orders", "requeued_messages"), 0);
    assert_eq!(harness.stats.incr_count("orders", "rejected_messages"), 0);
    assert!(broker.events().iter().any(|e| matches!(
        e,
        BrokerEvent::ConsumeStarted { auto_ack: true, .. }
    )));

    harness.stop_and_join(StopMode::Graceful).await;
}

#[tokio::test]
async fn fatal_error_restarts_immediately() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);
    broker.push_batch("main", vec![]);

    let consumer = ScriptedConsumer::new();
    consumer.push(Err(ProcessingError::Fatal("corrupt state".to_string())));

    // Threshold disabled; fatal bypasses it.
    let mut harness = Harness::start(broker.clone(), group_spec(None), consumer);

    harness.wait_for(|s| s.restarts == 1).await;
    assert_eq!(broker.connects("main"), 2);
    assert_eq!(harness.stats.incr_count("orders", "unhandled_exceptions"), 1);

    harness.stop_and_join(StopMode::Graceful).await;
}

#[tokio::test]
async fn unknown_consumer_reference_fails_without_connecting() {
    let broker = MockBroker::new();
    let mut spec = group_spec(None);
    spec.consumer = "missing".to_string();
    let mut harness = Harness::start(broker.clone(), spec, ScriptedConsumer::new());

    let status = harness.wait_for(|s| s.state == WorkerState::Failed).await;
    assert_eq!(status.restarts, 0);
    assert_eq!(broker.connects("main"), 0);
}

#[tokio::test]
async fn initial_connect_exhaustion_is_permanent() {
    let broker = MockBroker::new();
    broker.refuse_connects("main", 10);
    let mut harness = Harness::start(broker.clone(), group_spec(None), ScriptedConsumer::new());

    let status = harness.wait_for(|s| s.state == WorkerState::Failed).await;
    assert_eq!(status.processed, 0);
    let refused = broker
        .events()
        .iter()
        .filter(|e| matches!(e, BrokerEvent::ConnectRefused { .. }))
        .count();
    assert_eq!(refused, 3);
}

#[tokio::test]
async fn midstream_close_triggers_reconnect() {
    let broker = MockBroker::new();
    broker.push_batch(
        "main",
        vec![ScriptItem::Deliver(delivery(1)), ScriptItem::Close],
    );
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(2))]);

    let mut harness = Harness::start(broker.clone(), group_spec(None), ScriptedConsumer::new());

    let status = harness
        .wait_for(|s| s.processed == 2 && s.restarts == 1)
        .await;
    assert_eq!(status.failed, 0);
    assert_eq!(broker.connects("main"), 2);
    assert_eq!(broker.acked_tags(), vec![1, 2]);

    harness.stop_and_join(StopMode::Graceful).await;
}

#[tokio::test]
async fn redeliveries_are_counted() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(redelivery(9))]);
    let mut harness = Harness::start(broker.clone(), group_spec(None), ScriptedConsumer::new());

    harness.wait_for(|s| s.processed == 1).await;
    assert_eq!(
        harness.stats.incr_count("orders", "redelivered_messages"),
        1
    );

    harness.stop_and_join(StopMode::Graceful).await;
}

struct SlowConsumer;

#[async_trait]
impl MessageConsumer for SlowConsumer {
    async fn process(
        &self,
        _delivery: &Delivery,
        _config: &serde_json::Value,
    ) -> Result<Disposition, ProcessingError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Disposition::Ack)
    }
}

#[tokio::test]
async fn graceful_stop_finishes_the_in_flight_delivery() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);
    let harness = Harness::start(broker.clone(), group_spec(None), Arc::new(SlowConsumer));

    // Let the handler start working, then ask for a graceful stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = harness.stop_and_join(StopMode::Graceful).await;

    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.processed, 1);
    assert_eq!(broker.acked_tags(), vec![1]);
}

#[tokio::test]
async fn immediate_stop_abandons_and_requeues() {
    let broker = MockBroker::new();
    broker.push_batch("main", vec![ScriptItem::Deliver(delivery(1))]);
    let harness = Harness::start(broker.clone(), group_spec(None), Arc::new(SlowConsumer));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = harness.stop_and_join(StopMode::Immediate).await;

    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.processed, 0);
    assert!(broker.acked_tags().is_empty());
    // The drain requeues the abandoned delivery with a multiple-flag nack.
    assert_eq!(broker.nacks(), vec![(1, true, true)]);
}

#[tokio::test]
async fn publish_channel_honors_confirm_flag() {
    let broker = MockBroker::new();
    let bindings = vec![
        ConnectionBinding::consume_only("main"),
        ConnectionBinding {
            connection: "outbound".to_string(),
            consume: false,
            publisher_confirmation: true,
        },
    ];
    let specs = HashMap::from([
        ("main".to_string(), Arc::new(ConnectionSpec::default())),
        ("outbound".to_string(), Arc::new(ConnectionSpec::default())),
    ]);
    let (_stop, mut shutdown) = broadcast::channel::<StopMode>(1);

    let mut manager = ConnectionManager::new(
        broker.clone(),
        specs,
        bindings,
        BackoffPolicy::constant(Duration::from_millis(5)),
        1,
    );
    manager.open_all(true, &mut shutdown).await.unwrap();
    assert_eq!(manager.open_count(), 2);

    // Only the consume binding yields a consume channel.
    let channels = manager.consume_channels(1).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].0, "main");

    let publisher = manager.publish_channel("outbound").await.unwrap();
    assert!(publisher.publish("events", "orders.created", b"{}").await.unwrap());

    let events = broker.events();
    assert!(events.contains(&BrokerEvent::ChannelOpened {
        connection: "outbound".to_string(),
        prefetch: 0,
        confirm_mode: true,
    }));
    assert!(events.contains(&BrokerEvent::Published {
        connection: "outbound".to_string(),
        exchange: "events".to_string(),
        routing_key: "orders.created".to_string(),
    }));

    manager.close(true).await;
    assert_eq!(manager.open_count(), 0);
}
