//! Per-worker consumer core: broker abstraction, connection lifecycle,
//! delivery dispatch, error accounting, and the worker state machine.
//!
//! A [`ConsumerWorker`] owns its broker connections outright and shares no
//! mutable state with its siblings. Supervision of many workers lives one
//! crate up; the handler contract ([`MessageConsumer`]) is the plug-in point
//! for application logic.

pub mod accountant;
pub mod broker;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod testing;
pub mod worker;

pub use accountant::{Decision, ErrorAccountant};
pub use broker::{Broker, BrokerChannel, BrokerConnection, ChannelOptions, LapinBroker};
pub use connection::{BackoffPolicy, ConnectionManager};
pub use dispatcher::{DeliveryDispatcher, DispatchedDelivery};
pub use handler::{ConsumerRegistry, LogConsumer, MessageConsumer};
pub use worker::{ConsumerWorker, StopMode, WorkerOptions};
