//! Connection lifecycle management for one worker.
//!
//! Each worker owns exactly one open connection per declared binding. The
//! manager handles open/close and the reconnect policy: exponential backoff
//! with jitter and a capped maximum delay, bounded attempts during the
//! initial start, unbounded afterwards. A shutdown signal aborts any
//! in-flight attempt or backoff wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{info, warn};

use drover_common::{ChannelError, ConnectError, ConnectionBinding, ConnectionSpec};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOptions};
use crate::worker::StopMode;

/// Reconnect backoff: `min(base * 2^(attempt-1), cap)` with up to
/// `jitter` relative spread.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn constant(delay: Duration) -> Self {
        Self {
            base: delay,
            cap: delay,
            jitter: 0.0,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let capped = raw.min(self.cap);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor.max(0.0))
    }
}

pub struct ManagedConnection {
    pub binding: ConnectionBinding,
    pub connection: Box<dyn BrokerConnection>,
}

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    specs: HashMap<String, Arc<ConnectionSpec>>,
    bindings: Vec<ConnectionBinding>,
    backoff: BackoffPolicy,
    max_initial_attempts: u32,
    connections: Vec<ManagedConnection>,
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        specs: HashMap<String, Arc<ConnectionSpec>>,
        bindings: Vec<ConnectionBinding>,
        backoff: BackoffPolicy,
        max_initial_attempts: u32,
    ) -> Self {
        Self {
            broker,
            specs,
            bindings,
            backoff,
            max_initial_attempts: max_initial_attempts.max(1),
            connections: Vec::new(),
        }
    }

    /// Open every declared connection exactly once. With `bounded` set
    /// (the initial start), attempts per connection are limited and
    /// exhaustion is a permanent failure; otherwise retries continue until
    /// a connection is made or shutdown is requested.
    pub async fn open_all(
        &mut self,
        bounded: bool,
        shutdown: &mut broadcast::Receiver<StopMode>,
    ) -> Result<(), ConnectError> {
        for binding in self.bindings.clone() {
            let spec = self
                .specs
                .get(&binding.connection)
                .cloned()
                .ok_or_else(|| ConnectError::UnknownConnection(binding.connection.clone()))?;

            let connection = self
                .connect_with_retry(&binding.connection, &spec, bounded, shutdown)
                .await?;

            self.connections.push(ManagedConnection {
                binding,
                connection,
            });
        }
        Ok(())
    }

    async fn connect_with_retry(
        &self,
        name: &str,
        spec: &ConnectionSpec,
        bounded: bool,
        shutdown: &mut broadcast::Receiver<StopMode>,
    ) -> Result<Box<dyn BrokerConnection>, ConnectError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = shutdown.recv() => return Err(ConnectError::ShuttingDown),
                result = self.broker.connect(name, spec) => result,
            };

            match result {
                Ok(connection) => {
                    info!(connection = %name, attempt, "Broker connection open");
                    return Ok(connection);
                }
                Err(e) => {
                    if bounded && attempt >= self.max_initial_attempts {
                        warn!(
                            connection = %name,
                            attempts = attempt,
                            error = %e,
                            "Initial connect attempts exhausted"
                        );
                        return Err(ConnectError::AttemptsExhausted { attempts: attempt });
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        connection = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => return Err(ConnectError::ShuttingDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One channel per consume-enabled binding, QoS applied.
    pub async fn consume_channels(
        &self,
        prefetch: u16,
    ) -> Result<Vec<(String, Box<dyn BrokerChannel>)>, ChannelError> {
        let mut channels = Vec::new();
        for managed in self.connections.iter().filter(|m| m.binding.consume) {
            let channel = managed
                .connection
                .open_channel(ChannelOptions {
                    prefetch,
                    confirm_mode: false,
                })
                .await?;
            channels.push((managed.binding.connection.clone(), channel));
        }
        Ok(channels)
    }

    /// Channel for publishing on a named binding, confirm mode per its
    /// `publisher_confirmation` flag. Works for `consume: false` bindings.
    pub async fn publish_channel(
        &self,
        connection_name: &str,
    ) -> Result<Box<dyn BrokerChannel>, ChannelError> {
        let managed = self
            .connections
            .iter()
            .find(|m| m.binding.connection == connection_name)
            .ok_or(ChannelError::Closed)?;
        managed
            .connection
            .open_channel(ChannelOptions {
                prefetch: 0,
                confirm_mode: managed.binding.publisher_confirmation,
            })
            .await
    }

    pub fn open_count(&self) -> usize {
        self.connections.iter().filter(|m| m.connection.is_open()).count()
    }

    /// Close all connections. Close errors are logged inside the broker
    /// implementations; this path never fails.
    pub async fn close(&mut self, graceful: bool) {
        for managed in self.connections.drain(..) {
            info!(
                connection = %managed.binding.connection,
                graceful,
                "Closing broker connection"
            );
            managed.connection.close().await;
        }
    }
}
