//! The consumer-logic plug-in point.
//!
//! User code implements [`MessageConsumer`]; the configured reference is
//! resolved through the [`ConsumerRegistry`] once at worker startup, so the
//! hot path never does a lookup by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use drover_common::{ConfigError, Delivery, Disposition, ProcessingError};

/// Contract for user-supplied consumer logic. Implementations are shared
/// across every worker of a group and must be safe for concurrent use.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Process one delivery with the group's free-form config block.
    ///
    /// A `Recoverable` error is counted against the group's error threshold
    /// and the message is rejected per policy; a `Fatal` error forces an
    /// immediate worker restart.
    async fn process(
        &self,
        delivery: &Delivery,
        config: &serde_json::Value,
    ) -> Result<Disposition, ProcessingError>;

    /// Graceful-shutdown hook, called once per worker while draining.
    async fn shutdown(&self) {}
}

/// Maps handler references from the configuration to implementations.
/// Populated once at process start.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: HashMap<String, Arc<dyn MessageConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogConsumer));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn MessageConsumer>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn MessageConsumer>, ConfigError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownConsumer(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Built-in smoke-test consumer: logs delivery metadata and acks.
pub struct LogConsumer;

#[async_trait]
impl MessageConsumer for LogConsumer {
    async fn process(
        &self,
        delivery: &Delivery,
        _config: &serde_json::Value,
    ) -> Result<Disposition, ProcessingError> {
        info!(
            delivery_tag = delivery.delivery_tag,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            bytes = delivery.payload.len(),
            correlation_id = ?delivery.correlation_id,
            "Received delivery"
        );
        Ok(Disposition::Ack)
    }
}
