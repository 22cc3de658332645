//! The per-worker state machine.
//!
//! Lifecycle: `Starting -> Connecting -> Consuming -> Draining -> Stopped`,
//! with the error edge `Consuming -> Restarting -> Connecting` and the
//! terminal `Failed` for permanent problems (unknown handler reference,
//! initial connect attempts exhausted). Transient broker trouble never
//! escapes a worker; it restarts itself and keeps going.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drover_common::{
    counters, ConnectError, ConnectionSpec, ConsumerGroupSpec, Disposition, StatsSink,
    WorkerState, WorkerStatus, QOS_MAX,
};

use crate::accountant::{Decision, ErrorAccountant};
use crate::broker::Broker;
use crate::connection::{BackoffPolicy, ConnectionManager};
use crate::dispatcher::{DeliveryDispatcher, DispatchedDelivery};
use crate::handler::{ConsumerRegistry, MessageConsumer};

/// How a worker should wind down when signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the in-flight delivery, then drain and close.
    Graceful,
    /// Abandon the in-flight delivery; the drain requeues it.
    Immediate,
}

/// Tunables that are not part of the group configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Connect attempts allowed during the initial start before the worker
    /// fails permanently. Reconnects after a restart are unbounded.
    pub max_connect_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of one consuming session.
enum Flow {
    Restart,
    Stop(StopMode),
}

/// Outcome of one delivery.
enum Step {
    Continue,
    Restart,
    Stop(StopMode),
}

pub struct ConsumerWorker {
    worker_id: String,
    spec: Arc<ConsumerGroupSpec>,
    connection_specs: HashMap<String, Arc<ConnectionSpec>>,
    registry: Arc<ConsumerRegistry>,
    broker: Arc<dyn Broker>,
    stats: Arc<dyn StatsSink>,
    options: WorkerOptions,
    shutdown: broadcast::Receiver<StopMode>,
    status: WorkerStatus,
    status_tx: watch::Sender<WorkerStatus>,
}

impl ConsumerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        spec: Arc<ConsumerGroupSpec>,
        connection_specs: HashMap<String, Arc<ConnectionSpec>>,
        registry: Arc<ConsumerRegistry>,
        broker: Arc<dyn Broker>,
        stats: Arc<dyn StatsSink>,
        options: WorkerOptions,
        shutdown: broadcast::Receiver<StopMode>,
    ) -> (Self, watch::Receiver<WorkerStatus>) {
        let status = WorkerStatus::new(worker_id.into(), spec.name.clone());
        let (status_tx, status_rx) = watch::channel(status.clone());
        let worker = Self {
            worker_id: status.worker_id.clone(),
            spec,
            connection_specs,
            registry,
            broker,
            stats,
            options,
            shutdown,
            status,
            status_tx,
        };
        (worker, status_rx)
    }

    /// Drive the worker until it reaches a terminal state. Intended to be
    /// spawned as its own task.
    pub async fn run(mut self) {
        self.set_state(WorkerState::Starting);

        let handler = match self.registry.resolve(&self.spec.consumer) {
            Ok(handler) => handler,
            Err(e) => {
                error!(
                    worker = %self.worker_id,
                    consumer = %self.spec.consumer,
                    error = %e,
                    "Worker cannot start"
                );
                self.set_state(WorkerState::Failed);
                return;
            }
        };

        let mut manager = ConnectionManager::new(
            self.broker.clone(),
            self.connection_specs.clone(),
            self.spec.connections.clone(),
            self.options.backoff.clone(),
            self.options.max_connect_attempts,
        );
        let mut accountant = ErrorAccountant::for_spec(&self.spec);
        let mut initial = true;

        loop {
            self.set_state(WorkerState::Connecting);
            accountant.reset();

            match manager.open_all(initial, &mut self.shutdown).await {
                Ok(()) => {}
                Err(ConnectError::ShuttingDown) => {
                    manager.close(false).await;
                    self.set_state(WorkerState::Stopped);
                    return;
                }
                Err(e) => {
                    error!(
                        worker = %self.worker_id,
                        error = %e,
                        "Worker lost permanently"
                    );
                    manager.close(false).await;
                    self.set_state(WorkerState::Failed);
                    return;
                }
            }
            initial = false;

            let mut dispatcher = match self.open_dispatcher(&manager).await {
                Ok(dispatcher) => dispatcher,
                Err(e) => {
                    warn!(
                        worker = %self.worker_id,
                        error = %e,
                        "Channel setup failed, reconnecting"
                    );
                    manager.close(false).await;
                    self.note_restart();
                    continue;
                }
            };

            self.set_state(WorkerState::Consuming);
            info!(
                worker = %self.worker_id,
                queue = %self.spec.queue,
                prefetch = self.spec.qos_prefetch.min(QOS_MAX),
                ack = self.spec.ack,
                "Consuming"
            );

            match self
                .consume_loop(&handler, &mut dispatcher, &mut accountant)
                .await
            {
                Flow::Restart => {
                    self.set_state(WorkerState::Restarting);
                    dispatcher.drain(true).await;
                    manager.close(false).await;
                    self.note_restart();
                }
                Flow::Stop(mode) => {
                    self.set_state(WorkerState::Draining);
                    if mode == StopMode::Graceful {
                        handler.shutdown().await;
                    }
                    dispatcher.drain(true).await;
                    manager.close(mode == StopMode::Graceful).await;
                    info!(
                        worker = %self.worker_id,
                        processed = self.status.processed,
                        failed = self.status.failed,
                        restarts = self.status.restarts,
                        "Worker stopped"
                    );
                    self.set_state(WorkerState::Stopped);
                    return;
                }
            }
        }
    }

    async fn open_dispatcher(
        &self,
        manager: &ConnectionManager,
    ) -> Result<DeliveryDispatcher, drover_common::ChannelError> {
        let prefetch = self.spec.qos_prefetch.min(QOS_MAX);
        let channels = manager.consume_channels(prefetch).await?;
        let mut dispatcher = DeliveryDispatcher::new(channels, !self.spec.ack);
        let tag_base = format!("{}-{}", self.spec.name, Uuid::new_v4());
        dispatcher.start(&self.spec.queue, &tag_base).await?;
        Ok(dispatcher)
    }

    async fn consume_loop(
        &mut self,
        handler: &Arc<dyn MessageConsumer>,
        dispatcher: &mut DeliveryDispatcher,
        accountant: &mut ErrorAccountant,
    ) -> Flow {
        loop {
            let item = tokio::select! {
                stop = self.shutdown.recv() => return Flow::Stop(stop_mode(stop)),
                item = dispatcher.next() => item,
            };

            match item {
                None => {
                    warn!(worker = %self.worker_id, "All consume streams ended");
                    return Flow::Restart;
                }
                Some(Err(e)) => {
                    warn!(worker = %self.worker_id, error = %e, "Channel failure");
                    return Flow::Restart;
                }
                Some(Ok(dispatched)) => {
                    match self
                        .handle_delivery(handler, dispatcher, accountant, dispatched)
                        .await
                    {
                        Step::Continue => {}
                        Step::Restart => return Flow::Restart,
                        Step::Stop(mode) => return Flow::Stop(mode),
                    }
                }
            }
        }
    }

    async fn handle_delivery(
        &mut self,
        handler: &Arc<dyn MessageConsumer>,
        dispatcher: &mut DeliveryDispatcher,
        accountant: &mut ErrorAccountant,
        dispatched: DispatchedDelivery,
    ) -> Step {
        let measurement = self.spec.measurement().to_string();
        let DispatchedDelivery { channel, delivery } = dispatched;

        if delivery.redelivered {
            self.stats.incr(&measurement, counters::REDELIVERED);
        }

        // Race the handler against shutdown. A graceful stop lets the
        // in-flight delivery finish; an immediate stop abandons it and the
        // drain requeues it.
        let mut pending_stop = None;
        let started = Instant::now();
        let mut process = pin!(handler.process(&delivery, &self.spec.config));
        let result = loop {
            tokio::select! {
                stop = self.shutdown.recv() => {
                    match stop_mode(stop) {
                        StopMode::Immediate => return Step::Stop(StopMode::Immediate),
                        StopMode::Graceful => pending_stop = Some(StopMode::Graceful),
                    }
                }
                result = &mut process => break result,
            }
        };
        self.stats
            .timing(&measurement, counters::TIME_SPENT, started.elapsed());

        let step = match result {
            Ok(Disposition::Ack) => {
                self.status.processed += 1;
                self.stats.incr(&measurement, counters::PROCESSED);
                if self.spec.ack {
                    self.stats.incr(&measurement, counters::ACKED);
                }
                accountant.record_success();
                match dispatcher.ack(channel, delivery.delivery_tag).await {
                    Ok(()) => Step::Continue,
                    Err(e) => {
                        warn!(worker = %self.worker_id, error = %e, "Ack failed");
                        Step::Restart
                    }
                }
            }
            Ok(Disposition::Reject { requeue }) => {
                self.status.processed += 1;
                self.stats.incr(&measurement, counters::PROCESSED);
                // In auto-ack mode no nack is ever sent, so the rejection
                // counters only move when the worker settles deliveries.
                if self.spec.ack {
                    self.stats.incr(
                        &measurement,
                        if requeue {
                            counters::REQUEUED
                        } else {
                            counters::REJECTED
                        },
                    );
                }
                accountant.record_success();
                match dispatcher
                    .reject(channel, delivery.delivery_tag, requeue)
                    .await
                {
                    Ok(()) => Step::Continue,
                    Err(e) => {
                        warn!(worker = %self.worker_id, error = %e, "Reject failed");
                        Step::Restart
                    }
                }
            }
            Err(e) => {
                let fatal = e.is_fatal();
                // A configured error exchange means the broker dead-letters
                // rejected messages, so they must not be requeued.
                let requeue = self.spec.error_exchange.is_none();
                warn!(
                    worker = %self.worker_id,
                    delivery_tag = delivery.delivery_tag,
                    fatal,
                    requeue,
                    error = %e,
                    "Delivery processing failed"
                );
                self.status.failed += 1;
                self.stats.incr(&measurement, counters::FAILED);
                if fatal {
                    self.stats.incr(&measurement, counters::UNHANDLED);
                }
                if self.spec.ack {
                    self.stats.incr(
                        &measurement,
                        if requeue {
                            counters::REQUEUED
                        } else {
                            counters::REJECTED
                        },
                    );
                }
                let settle = dispatcher
                    .reject(channel, delivery.delivery_tag, requeue)
                    .await;
                if let Err(e) = settle {
                    warn!(worker = %self.worker_id, error = %e, "Reject failed");
                    return Step::Restart;
                }
                match accountant.record_failure(fatal) {
                    Decision::Restart => {
                        debug!(
                            worker = %self.worker_id,
                            errors = accountant.count(),
                            "Error threshold reached"
                        );
                        Step::Restart
                    }
                    Decision::Continue => Step::Continue,
                }
            }
        };

        self.publish_status();
        match (pending_stop, step) {
            (Some(mode), Step::Continue) => Step::Stop(mode),
            (Some(mode), Step::Restart) => Step::Stop(mode),
            (_, step) => step,
        }
    }

    fn note_restart(&mut self) {
        self.status.restarts += 1;
        self.stats
            .incr(self.spec.measurement(), counters::RECONNECTED);
        self.publish_status();
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(worker = %self.worker_id, state = %state, "State change");
        self.status.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}

fn stop_mode(received: Result<StopMode, broadcast::error::RecvError>) -> StopMode {
    received.unwrap_or(StopMode::Graceful)
}
