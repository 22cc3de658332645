//! In-memory broker, scripted consumer logic, and a recording stats sink
//! for the test suites. Nothing here touches a real broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use drover_common::{
    ChannelError, ConnectError, ConnectionSpec, Delivery, Disposition, ProcessingError, StatsSink,
};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOptions};
use crate::handler::MessageConsumer;

/// One scripted item on a connection's delivery stream.
pub enum ScriptItem {
    Deliver(Delivery),
    /// Channel-level error surfaced from the stream.
    Fail(String),
    /// Stream ends, as if the broker closed the channel.
    Close,
}

/// Everything the mock broker observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected { connection: String },
    ConnectRefused { connection: String },
    ChannelOpened { connection: String, prefetch: u16, confirm_mode: bool },
    ConsumeStarted { connection: String, queue: String, auto_ack: bool },
    Acked { connection: String, tag: u64 },
    Nacked { connection: String, tag: u64, requeue: bool, multiple: bool },
    Published { connection: String, exchange: String, routing_key: String },
    Cancelled { connection: String },
    ChannelClosed { connection: String },
    ConnectionClosed { connection: String },
}

#[derive(Default)]
struct ConnectionScript {
    refuse: u32,
    batches: VecDeque<Vec<ScriptItem>>,
}

/// Scriptable in-memory broker. Each successful connect hands the next
/// scripted batch of deliveries to that connection's consume channel; an
/// exhausted script leaves the channel idle (pending forever), which is how
/// a quiet queue behaves.
#[derive(Default)]
pub struct MockBroker {
    scripts: Mutex<HashMap<String, ConnectionScript>>,
    events: Arc<Mutex<Vec<BrokerEvent>>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` connect attempts for a connection name.
    pub fn refuse_connects(&self, name: &str, n: u32) {
        self.scripts.lock().entry(name.to_string()).or_default().refuse = n;
    }

    /// Queue a batch of scripted items, consumed by the next connect.
    pub fn push_batch(&self, name: &str, items: Vec<ScriptItem>) {
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .batches
            .push_back(items);
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.events.lock().clone()
    }

    pub fn connects(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Connected { connection } if connection == name))
            .count()
    }

    pub fn acked_tags(&self) -> Vec<u64> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                BrokerEvent::Acked { tag, .. } => Some(*tag),
                _ => None,
            })
            .collect()
    }

    pub fn nacks(&self) -> Vec<(u64, bool, bool)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                BrokerEvent::Nacked {
                    tag,
                    requeue,
                    multiple,
                    ..
                } => Some((*tag, *requeue, *multiple)),
                _ => None,
            })
            .collect()
    }
}

/// Build a plain test delivery.
pub fn delivery(tag: u64) -> Delivery {
    Delivery {
        delivery_tag: tag,
        exchange: String::new(),
        routing_key: "test".to_string(),
        redelivered: false,
        payload: Bytes::from_static(b"{}"),
        correlation_id: None,
        content_type: None,
        app_id: None,
    }
}

pub fn redelivery(tag: u64) -> Delivery {
    Delivery {
        redelivered: true,
        ..delivery(tag)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        name: &str,
        _spec: &ConnectionSpec,
    ) -> Result<Box<dyn BrokerConnection>, ConnectError> {
        let batch = {
            let mut scripts = self.scripts.lock();
            let script = scripts.entry(name.to_string()).or_default();
            if script.refuse > 0 {
                script.refuse -= 1;
                self.events.lock().push(BrokerEvent::ConnectRefused {
                    connection: name.to_string(),
                });
                return Err(ConnectError::Broker("connection refused".to_string()));
            }
            script.batches.pop_front().unwrap_or_default()
        };

        self.events.lock().push(BrokerEvent::Connected {
            connection: name.to_string(),
        });

        Ok(Box::new(MockConnection {
            name: name.to_string(),
            items: Arc::new(Mutex::new(VecDeque::from(batch))),
            events: self.events.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MockConnection {
    name: String,
    items: Arc<Mutex<VecDeque<ScriptItem>>>,
    events: Arc<Mutex<Vec<BrokerEvent>>>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Box<dyn BrokerChannel>, ChannelError> {
        self.events.lock().push(BrokerEvent::ChannelOpened {
            connection: self.name.clone(),
            prefetch: options.prefetch,
            confirm_mode: options.confirm_mode,
        });
        Ok(Box::new(MockChannel {
            name: self.name.clone(),
            items: self.items.clone(),
            events: self.events.clone(),
            stream_ended: false,
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.events.lock().push(BrokerEvent::ConnectionClosed {
            connection: self.name.clone(),
        });
    }
}

struct MockChannel {
    name: String,
    items: Arc<Mutex<VecDeque<ScriptItem>>>,
    events: Arc<Mutex<Vec<BrokerEvent>>>,
    stream_ended: bool,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn consume(
        &mut self,
        queue: &str,
        _consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<(), ChannelError> {
        self.events.lock().push(BrokerEvent::ConsumeStarted {
            connection: self.name.clone(),
            queue: queue.to_string(),
            auto_ack,
        });
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, ChannelError>> {
        if self.stream_ended {
            return None;
        }
        let item = self.items.lock().pop_front();
        match item {
            Some(ScriptItem::Deliver(delivery)) => Some(Ok(delivery)),
            Some(ScriptItem::Fail(reason)) => Some(Err(ChannelError::Broker(reason))),
            Some(ScriptItem::Close) => {
                self.stream_ended = true;
                None
            }
            None => {
                // Script exhausted: behave like an idle queue.
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.events.lock().push(BrokerEvent::Acked {
            connection: self.name.clone(),
            tag: delivery_tag,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.events.lock().push(BrokerEvent::Nacked {
            connection: self.name.clone(),
            tag: delivery_tag,
            requeue,
            multiple: false,
        });
        Ok(())
    }

    async fn reject_up_to(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.events.lock().push(BrokerEvent::Nacked {
            connection: self.name.clone(),
            tag: delivery_tag,
            requeue,
            multiple: true,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _payload: &[u8],
    ) -> Result<bool, ChannelError> {
        self.events.lock().push(BrokerEvent::Published {
            connection: self.name.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(true)
    }

    async fn cancel(&mut self) {
        self.events.lock().push(BrokerEvent::Cancelled {
            connection: self.name.clone(),
        });
    }

    async fn close(&self) {
        self.events.lock().push(BrokerEvent::ChannelClosed {
            connection: self.name.clone(),
        });
    }
}

// ============================================================================
// Scripted consumer logic
// ============================================================================

/// Handler whose outcomes are scripted per delivery; defaults to `Ack` once
/// the script runs out. Records the tags it processed.
#[derive(Default)]
pub struct ScriptedConsumer {
    outcomes: Mutex<VecDeque<Result<Disposition, ProcessingError>>>,
    processed: Mutex<Vec<u64>>,
}

impl ScriptedConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler that fails every delivery with a recoverable error.
    pub fn always_failing() -> Arc<Self> {
        let consumer = Self::new();
        for _ in 0..64 {
            consumer.push(Err(ProcessingError::Recoverable("scripted".to_string())));
        }
        consumer
    }

    pub fn push(&self, outcome: Result<Disposition, ProcessingError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn processed_tags(&self) -> Vec<u64> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl MessageConsumer for ScriptedConsumer {
    async fn process(
        &self,
        delivery: &Delivery,
        _config: &serde_json::Value,
    ) -> Result<Disposition, ProcessingError> {
        self.processed.lock().push(delivery.delivery_tag);
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or(Ok(Disposition::Ack))
    }
}

// ============================================================================
// Recording stats sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StatEntry {
    Incr(String, String),
    Timing(String, String, Duration),
    Gauge(String, String, f64),
}

/// Stats sink that records every emission for assertions.
#[derive(Default)]
pub struct RecordingStatsSink {
    entries: Mutex<Vec<StatEntry>>,
}

impl RecordingStatsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<StatEntry> {
        self.entries.lock().clone()
    }

    pub fn incr_count(&self, measurement: &str, counter: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| {
                matches!(e, StatEntry::Incr(m, c) if m == measurement && c == counter)
            })
            .count()
    }
}

impl StatsSink for RecordingStatsSink {
    fn incr(&self, measurement: &str, counter: &str) {
        self.entries
            .lock()
            .push(StatEntry::Incr(measurement.to_string(), counter.to_string()));
    }

    fn timing(&self, measurement: &str, name: &str, duration: Duration) {
        self.entries.lock().push(StatEntry::Timing(
            measurement.to_string(),
            name.to_string(),
            duration,
        ));
    }

    fn gauge(&self, measurement: &str, name: &str, value: f64) {
        self.entries.lock().push(StatEntry::Gauge(
            measurement.to_string(),
            name.to_string(),
            value,
        ));
    }
}
