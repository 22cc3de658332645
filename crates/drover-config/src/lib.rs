//! Configuration surface for the consumer host.
//!
//! Reads the YAML settings tree (connections keyed by name, consumers keyed
//! by name), applies defaults, and validates cross-references before the
//! supervisor ever sees a spec. Everything returned here is immutable and
//! shared by reference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use drover_common::{ConfigError, ConnectionSpec, ConsumerGroupSpec, QOS_MAX};

/// Validated, load-once settings for the whole process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connections: HashMap<String, Arc<ConnectionSpec>>,
    /// Sorted by group name for deterministic startup order.
    pub consumers: Vec<Arc<ConsumerGroupSpec>>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    connections: HashMap<String, ConnectionSpec>,
    #[serde(default)]
    consumers: HashMap<String, ConsumerGroupSpec>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawSettings =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let connections: HashMap<String, Arc<ConnectionSpec>> = raw
            .connections
            .into_iter()
            .map(|(name, spec)| (name, Arc::new(spec)))
            .collect();

        let mut consumers = Vec::with_capacity(raw.consumers.len());
        for (name, mut spec) in raw.consumers {
            spec.name = name;
            validate_group(&mut spec, &connections)?;
            consumers.push(Arc::new(spec));
        }
        consumers.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            connections = connections.len(),
            consumers = consumers.len(),
            "Settings parsed"
        );

        Ok(Self {
            connections,
            consumers,
        })
    }

    pub fn consumer(&self, name: &str) -> Option<&Arc<ConsumerGroupSpec>> {
        self.consumers.iter().find(|c| c.name == name)
    }
}

fn validate_group(
    spec: &mut ConsumerGroupSpec,
    connections: &HashMap<String, Arc<ConnectionSpec>>,
) -> Result<(), ConfigError> {
    if spec.queue.trim().is_empty() {
        return Err(ConfigError::InvalidGroup {
            group: spec.name.clone(),
            reason: "queue must not be empty".to_string(),
        });
    }
    if spec.qty == 0 {
        return Err(ConfigError::InvalidGroup {
            group: spec.name.clone(),
            reason: "qty must be at least 1".to_string(),
        });
    }
    if spec.connections.is_empty() {
        return Err(ConfigError::InvalidGroup {
            group: spec.name.clone(),
            reason: "at least one connection binding is required".to_string(),
        });
    }
    if !spec.connections.iter().any(|b| b.consume) {
        return Err(ConfigError::InvalidGroup {
            group: spec.name.clone(),
            reason: "at least one binding must have consume enabled".to_string(),
        });
    }
    for binding in &spec.connections {
        if !connections.contains_key(&binding.connection) {
            return Err(ConfigError::UnknownConnection {
                group: spec.name.clone(),
                connection: binding.connection.clone(),
            });
        }
    }
    if spec.qos_prefetch > QOS_MAX {
        debug!(
            group = %spec.name,
            requested = spec.qos_prefetch,
            cap = QOS_MAX,
            "Clamping qos_prefetch"
        );
        spec.qos_prefetch = QOS_MAX;
    }
    Ok(())
}
