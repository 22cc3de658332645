//! Process-wide supervision of consumer groups.
//!
//! The supervisor spawns `qty` fully independent workers per group, holds
//! their status receivers, and aggregates group health. Workers restart
//! themselves on transient trouble; the supervisor never resurrects a
//! worker that reported `Failed`. A fully failed group is surfaced as
//! `Down` for the operator to act on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drover_common::{
    ConnectionSpec, ConsumerGroupSpec, GroupHealth, StatsSink, WorkerState, WorkerStatus,
};
use drover_consumer::broker::Broker;
use drover_consumer::handler::ConsumerRegistry;
use drover_consumer::worker::{ConsumerWorker, StopMode, WorkerOptions};

/// Default interval for the periodic stats report.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub worker: WorkerOptions,
    pub stats_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

struct WorkerHandle {
    status: watch::Receiver<WorkerStatus>,
    task: JoinHandle<()>,
}

struct ConsumerGroup {
    spec: Arc<ConsumerGroupSpec>,
    stop: broadcast::Sender<StopMode>,
    workers: Vec<WorkerHandle>,
}

pub struct Supervisor {
    connections: HashMap<String, Arc<ConnectionSpec>>,
    registry: Arc<ConsumerRegistry>,
    broker: Arc<dyn Broker>,
    stats: Arc<dyn StatsSink>,
    options: SupervisorOptions,
    groups: DashMap<String, ConsumerGroup>,
    lifecycle: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        connections: HashMap<String, Arc<ConnectionSpec>>,
        registry: Arc<ConsumerRegistry>,
        broker: Arc<dyn Broker>,
        stats: Arc<dyn StatsSink>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (lifecycle, _) = broadcast::channel(1);
        Arc::new(Self {
            connections,
            registry,
            broker,
            stats,
            options,
            groups: DashMap::new(),
            lifecycle,
        })
    }

    /// Spawn `qty` workers for the group. Idempotent per group name: a
    /// second start for a running group is ignored.
    pub fn start_group(&self, spec: Arc<ConsumerGroupSpec>) {
        if self.groups.contains_key(&spec.name) {
            warn!(group = %spec.name, "Group already running");
            return;
        }

        let (stop, _) = broadcast::channel(8);
        let mut workers = Vec::with_capacity(spec.qty as usize);
        for index in 0..spec.qty {
            let worker_id = format!("{}-{}", spec.name, index);
            let (worker, status) = ConsumerWorker::new(
                worker_id,
                spec.clone(),
                self.connections.clone(),
                self.registry.clone(),
                self.broker.clone(),
                self.stats.clone(),
                self.options.worker.clone(),
                stop.subscribe(),
            );
            let task = tokio::spawn(worker.run());
            workers.push(WorkerHandle { status, task });
        }

        info!(group = %spec.name, qty = spec.qty, queue = %spec.queue, "Consumer group started");
        self.groups
            .insert(spec.name.clone(), ConsumerGroup { spec, stop, workers });
    }

    pub fn start_groups(&self, specs: impl IntoIterator<Item = Arc<ConsumerGroupSpec>>) {
        for spec in specs {
            self.start_group(spec);
        }
    }

    /// Signal every worker of the group and await their tasks. Returns
    /// false when the group is not running.
    pub async fn stop_group(&self, name: &str, graceful: bool) -> bool {
        let Some((_, group)) = self.groups.remove(name) else {
            return false;
        };

        let mode = if graceful {
            StopMode::Graceful
        } else {
            StopMode::Immediate
        };
        info!(group = %name, graceful, "Stopping consumer group");
        let _ = group.stop.send(mode);

        for worker in group.workers {
            if let Err(e) = worker.task.await {
                error!(group = %name, error = %e, "Worker task join failed");
            }
        }
        true
    }

    /// Snapshot of every worker's latest status. Empty for unknown groups.
    pub fn worker_status(&self, name: &str) -> Vec<WorkerStatus> {
        self.groups
            .get(name)
            .map(|group| {
                group
                    .workers
                    .iter()
                    .map(|w| w.status.borrow().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn group_health(&self, name: &str) -> Option<GroupHealth> {
        let statuses = self.worker_status(name);
        if statuses.is_empty() {
            return None;
        }
        let failed = statuses
            .iter()
            .filter(|s| s.state == WorkerState::Failed)
            .count();
        let terminal = statuses.iter().filter(|s| s.state.is_terminal()).count();
        Some(if failed == statuses.len() {
            GroupHealth::Down
        } else if terminal > 0 {
            GroupHealth::Degraded
        } else {
            GroupHealth::Up
        })
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every group, then the stats reporter.
    pub async fn shutdown(&self, graceful: bool) {
        for name in self.group_names() {
            self.stop_group(&name, graceful).await;
        }
        let _ = self.lifecycle.send(());
        info!("Supervisor shut down");
    }

    /// Periodic stats aggregation. Runs until `shutdown` is called.
    pub fn spawn_stats_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut lifecycle = self.lifecycle.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.options.stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick is immediate; skip it so the first report has
            // a full interval of data behind it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = lifecycle.recv() => break,
                    _ = ticker.tick() => supervisor.report_stats(),
                }
            }
            debug!("Stats reporter stopped");
        })
    }

    /// One aggregation pass over every group, forwarded to the stats sink
    /// under the group's measurement name.
    pub fn report_stats(&self) {
        for entry in self.groups.iter() {
            let measurement = entry.spec.measurement().to_string();
            let statuses: Vec<WorkerStatus> = entry
                .workers
                .iter()
                .map(|w| w.status.borrow().clone())
                .collect();

            let processed: u64 = statuses.iter().map(|s| s.processed).sum();
            let failed: u64 = statuses.iter().map(|s| s.failed).sum();
            let restarts: u32 = statuses.iter().map(|s| s.restarts).sum();

            self.stats.gauge(&measurement, "processed", processed as f64);
            self.stats.gauge(&measurement, "failed", failed as f64);
            self.stats.gauge(&measurement, "restarts", restarts as f64);
            self.stats
                .gauge(&measurement, "workers", statuses.len() as f64);

            let mut by_state: HashMap<WorkerState, usize> = HashMap::new();
            for status in &statuses {
                *by_state.entry(status.state).or_default() += 1;
            }
            for (state, count) in by_state {
                self.stats
                    .gauge(&measurement, &format!("workers_{}", state), count as f64);
            }

            debug!(
                group = %entry.spec.name,
                processed,
                failed,
                restarts,
                workers = statuses.len(),
                "Stats report"
            );
        }
    }
}
