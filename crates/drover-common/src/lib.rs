use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Delivery Types
// ============================================================================

/// One inbound message from the broker, identified by its delivery tag.
/// Owned by the dispatcher until it has been acked or rejected.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub app_id: Option<String>,
}

/// What the consumer logic wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Hard cap on the QoS prefetch window.
pub const QOS_MAX: u16 = 10_000;

/// Default QoS prefetch when a group does not configure one.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Default AMQP heartbeat interval in seconds. Zero disables heartbeats.
pub const DEFAULT_HEARTBEAT_SECS: u16 = 300;

/// Default quiet period after which the error counter resets.
pub const DEFAULT_ERROR_WINDOW_SECS: u64 = 60;

/// A named broker connection. Immutable after load, shared by every worker
/// that binds to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u16,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            vhost: default_vhost(),
            tls: false,
            heartbeat_interval: default_heartbeat(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_heartbeat() -> u16 {
    DEFAULT_HEARTBEAT_SECS
}

/// Binds a consumer group to one named connection. A binding with
/// `consume: false` still gets a channel (for publishing) but no consumption
/// is registered on it.
///
/// Deserializes from either a bare connection name or a full mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "BindingRepr")]
pub struct ConnectionBinding {
    pub connection: String,
    pub consume: bool,
    pub publisher_confirmation: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BindingRepr {
    Name(String),
    Spec {
        #[serde(alias = "name")]
        connection: String,
        #[serde(default = "default_true")]
        consume: bool,
        #[serde(default)]
        publisher_confirmation: bool,
    },
}

impl From<BindingRepr> for ConnectionBinding {
    fn from(repr: BindingRepr) -> Self {
        match repr {
            BindingRepr::Name(connection) => Self {
                connection,
                consume: true,
                publisher_confirmation: false,
            },
            BindingRepr::Spec {
                connection,
                consume,
                publisher_confirmation,
            } => Self {
                connection,
                consume,
                publisher_confirmation,
            },
        }
    }
}

impl ConnectionBinding {
    pub fn consume_only(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            consume: true,
            publisher_confirmation: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One named consumer definition. `qty` workers are spawned for it, each
/// fully independent. Immutable after load; owned by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerGroupSpec {
    #[serde(default)]
    pub name: String,
    /// Handler reference resolved through the consumer registry at worker
    /// startup.
    pub consumer: String,
    pub connections: Vec<ConnectionBinding>,
    #[serde(default = "default_qty")]
    pub qty: u16,
    pub queue: String,
    #[serde(default = "default_true")]
    pub ack: bool,
    /// Failure threshold that forces a worker restart. Absent or zero
    /// disables the threshold; failures are then recorded for stats only.
    #[serde(default)]
    pub max_errors: Option<u32>,
    /// Quiet period (seconds) after which the failure count resets. Zero
    /// disables the window.
    #[serde(default = "default_error_window")]
    pub error_window_secs: u64,
    /// Dead-letter exchange. When set, failed deliveries are rejected
    /// without requeue so the broker routes them there.
    #[serde(default)]
    pub error_exchange: Option<String>,
    #[serde(default = "default_prefetch")]
    pub qos_prefetch: u16,
    /// Stats measurement name; defaults to the group name.
    #[serde(default)]
    pub measurement: Option<String>,
    /// Free-form block passed verbatim to the consumer logic.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ConsumerGroupSpec {
    pub fn measurement(&self) -> &str {
        self.measurement.as_deref().unwrap_or(&self.name)
    }

    /// Threshold is active only when configured and positive.
    pub fn error_threshold(&self) -> Option<u32> {
        self.max_errors.filter(|n| *n > 0)
    }
}

fn default_qty() -> u16 {
    1
}

fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH
}

fn default_error_window() -> u64 {
    DEFAULT_ERROR_WINDOW_SECS
}

// ============================================================================
// Worker State & Status
// ============================================================================

/// Lifecycle states of a consumer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Connecting,
    Consuming,
    Restarting,
    Draining,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Consuming => "consuming",
            WorkerState::Restarting => "restarting",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of a worker, published on its status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub group: String,
    pub state: WorkerState,
    pub processed: u64,
    pub failed: u64,
    pub restarts: u32,
    pub started_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(worker_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            group: group.into(),
            state: WorkerState::Starting,
            processed: 0,
            failed: 0,
            restarts: 0,
            started_at: Utc::now(),
        }
    }
}

/// Aggregated health of a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupHealth {
    /// All workers running.
    Up,
    /// Some workers terminal, at least one still running.
    Degraded,
    /// Every worker failed; surfaced to the operator, never auto-restarted.
    Down,
}

// ============================================================================
// Stats Boundary
// ============================================================================

/// Counter names emitted through the stats sink.
pub mod counters {
    pub const ACKED: &str = "acked";
    pub const PROCESSED: &str = "processed";
    pub const FAILED: &str = "failed";
    pub const REDELIVERED: &str = "redelivered_messages";
    pub const REJECTED: &str = "rejected_messages";
    pub const REQUEUED: &str = "requeued_messages";
    pub const RECONNECTED: &str = "reconnected";
    pub const UNHANDLED: &str = "unhandled_exceptions";
    pub const TIME_SPENT: &str = "processing_time";
}

/// Narrow boundary the core emits typed counters/timers through. Concrete
/// backends live outside the core. Implementations must be safe for
/// concurrent use from many workers; the interface is append-only.
pub trait StatsSink: Send + Sync {
    fn incr(&self, measurement: &str, counter: &str);
    fn timing(&self, measurement: &str, name: &str, duration: Duration);
    fn gauge(&self, measurement: &str, name: &str, value: f64);
}

/// Sink that discards everything. Useful as a test default.
#[derive(Debug, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn incr(&self, _measurement: &str, _counter: &str) {}
    fn timing(&self, _measurement: &str, _name: &str, _duration: Duration) {}
    fn gauge(&self, _measurement: &str, _name: &str, _value: f64) {}
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure to establish or keep a broker connection. Transient; retried
/// with backoff until the worker shuts down.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker connect failed: {0}")]
    Broker(String),

    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect attempts exhausted after {attempts} tries")]
    AttemptsExhausted { attempts: u32 },

    #[error("connection {0} is not declared")]
    UnknownConnection(String),

    #[error("shutdown requested")]
    ShuttingDown,
}

/// Failure on an open channel. Transient; triggers a channel/connection
/// re-open through the worker restart path.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel operation failed: {0}")]
    Broker(String),

    #[error("channel closed")]
    Closed,
}

/// Consumer-logic failure for one delivery.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Counted by the error accountant; the message is rejected per policy.
    #[error("processing failed: {0}")]
    Recoverable(String),

    /// Forces an immediate worker restart, bypassing the threshold.
    #[error("fatal processing failure: {0}")]
    Fatal(String),
}

impl ProcessingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessingError::Fatal(_))
    }
}

/// Configuration problem detected at load or worker startup. Not retried;
/// the worker reports `Failed` without ever connecting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(String),

    #[error("consumer {group}: binding references undeclared connection {connection}")]
    UnknownConnection { group: String, connection: String },

    #[error("consumer {group}: {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("unknown consumer reference: {0}")]
    UnknownConsumer(String),
}
