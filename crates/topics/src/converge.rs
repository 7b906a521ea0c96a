use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::admin::{codes, AdminError, AdminPlane, CreateTopicOptions, TopicMetadata};

pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Desired topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Topic as the brokers report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicState {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PartitionChange {
    Grown { from: i32, to: i32 },
    Unchanged,
    /// Fewer partitions were requested than exist; nothing was sent.
    ShrinkRefused { observed: i32, desired: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TopicOutcome {
    Created,
    Converged { partitions_added_to: Option<i32>, config_altered: bool, shrink_refused: bool },
}

impl TopicOutcome {
    pub fn wrote(&self) -> bool {
        match self {
            TopicOutcome::Created => true,
            TopicOutcome::Converged { partitions_added_to, config_altered, .. } => partitions_added_to.is_some() || *config_altered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic {0} not found")]
    TopicNotFound(String),
    #[error("{op} topic {topic}: admin plane unavailable: {reason}")]
    AdminUnavailable { op: &'static str, topic: String, reason: String },
    #[error("{op} topic {topic}: timed out after {after:?}")]
    Timeout { op: &'static str, topic: String, after: Duration },
    #[error("{op} topic {topic} rejected by broker ({code}): {message}")]
    Rejected { op: &'static str, topic: String, code: i16, message: String },
}

impl TopicError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TopicError::AdminUnavailable { .. } | TopicError::Timeout { .. })
    }

    pub fn needs_operator(&self) -> bool {
        matches!(self, TopicError::Rejected { .. })
    }

    fn from_admin(op: &'static str, topic: &str, err: AdminError) -> Self {
        match err {
            AdminError::Unreachable(reason) => TopicError::AdminUnavailable { op, topic: topic.to_string(), reason },
            AdminError::Broker { code: codes::UNKNOWN_TOPIC_OR_PARTITION, .. } => TopicError::TopicNotFound(topic.to_string()),
            AdminError::Broker { code, message } => TopicError::Rejected { op, topic: topic.to_string(), code, message },
        }
    }
}

/// Drives topics toward their declared partition count and config overrides.
/// Partition counts only ever grow.
pub struct TopicConverger {
    admin: Arc<dyn AdminPlane>,
    timeout: Duration,
}

impl TopicConverger {
    pub fn new(admin: Arc<dyn AdminPlane>) -> Self {
        Self { admin, timeout: DEFAULT_ADMIN_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T, F>(&self, op: &'static str, topic: &str, fut: F) -> Result<T, TopicError>
    where
        F: Future<Output = Result<T, AdminError>>,
    {
        let t0 = Instant::now();
        let res = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r.map_err(|e| TopicError::from_admin(op, topic, e)),
            Err(_) => Err(TopicError::Timeout { op, topic: topic.to_string(), after: self.timeout }),
        };
        histogram!("topic_admin_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let result = if res.is_ok() { "ok" } else { "err" };
        counter!("topic_admin_calls_total", 1u64, "op" => op, "result" => result);
        res
    }

    /// Current state from the topic listing, `None` when absent.
    pub async fn state(&self, name: &str) -> Result<Option<TopicState>, TopicError> {
        let mut topics = self.call("list", name, self.admin.list_topics()).await?;
        Ok(topics.remove(name).map(|d| TopicState {
            name: name.to_string(),
            partitions: d.partitions,
            replication_factor: d.replication_factor,
            config: d.config,
        }))
    }

    pub async fn exists(&self, name: &str) -> Result<bool, TopicError> {
        Ok(self.state(name).await?.is_some())
    }

    /// Partition metadata for status syncs.
    pub async fn observe(&self, name: &str) -> Result<TopicMetadata, TopicError> {
        let names = [name.to_string()];
        let meta = self.call("describe", name, self.admin.describe_topics(&names)).await?;
        let Some(topic) = meta.into_iter().find(|m| m.name == name) else {
            return Err(TopicError::TopicNotFound(name.to_string()));
        };
        match topic.error_code {
            codes::NO_ERROR => Ok(topic),
            code => Err(TopicError::from_admin(
                "describe",
                name,
                AdminError::Broker { code, message: format!("describe returned error code {}", code) },
            )),
        }
    }

    pub async fn create(&self, spec: &TopicSpec) -> Result<(), TopicError> {
        let opts = CreateTopicOptions {
            name: spec.name.clone(),
            partitions: spec.partitions,
            replication_factor: spec.replication_factor,
            config: spec.config.clone(),
        };
        self.call("create", &spec.name, self.admin.create_topic(&opts)).await?;
        info!(topic = %spec.name, partitions = spec.partitions, replication_factor = spec.replication_factor, "topic created");
        Ok(())
    }

    /// Grow `name` to `desired` partitions if it has fewer.
    pub async fn ensure_partition_count(&self, name: &str, desired: i32) -> Result<PartitionChange, TopicError> {
        let observed = i32::try_from(self.observe(name).await?.partitions.len()).unwrap_or(i32::MAX);
        self.converge_partitions(name, observed, desired).await
    }

    async fn converge_partitions(&self, name: &str, observed: i32, desired: i32) -> Result<PartitionChange, TopicError> {
        if desired == observed {
            return Ok(PartitionChange::Unchanged);
        }
        if desired < observed {
            counter!("topic_shrink_refused_total", 1u64);
            warn!(topic = %name, observed, desired, "partition count can only grow; leaving topic as is");
            return Ok(PartitionChange::ShrinkRefused { observed, desired });
        }
        self.call("create_partitions", name, self.admin.create_partitions(name, desired, None)).await?;
        info!(topic = %name, from = observed, to = desired, "partitions added");
        Ok(PartitionChange::Grown { from: observed, to: desired })
    }

    /// Replace the config overrides of `name` when they differ from `desired`.
    /// Returns whether an alter was issued.
    pub async fn ensure_config(&self, name: &str, desired: &BTreeMap<String, String>) -> Result<bool, TopicError> {
        let observed = self.state(name).await?.ok_or_else(|| TopicError::TopicNotFound(name.to_string()))?;
        self.converge_config(name, &observed.config, desired).await
    }

    async fn converge_config(
        &self,
        name: &str,
        observed: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<bool, TopicError> {
        if observed == desired {
            return Ok(false);
        }
        self.call("alter_config", name, self.admin.alter_topic_config(name, desired)).await?;
        info!(topic = %name, keys = desired.len(), "topic config replaced");
        Ok(true)
    }

    /// Create the topic if absent, otherwise converge partitions then config.
    pub async fn ensure(&self, spec: &TopicSpec) -> Result<TopicOutcome, TopicError> {
        let Some(state) = self.state(&spec.name).await? else {
            self.create(spec).await?;
            return Ok(TopicOutcome::Created);
        };
        if state.replication_factor != spec.replication_factor {
            debug!(topic = %spec.name, observed = state.replication_factor, desired = spec.replication_factor, "replication factor is not reconciled");
        }
        let change = self.converge_partitions(&spec.name, state.partitions, spec.partitions).await?;
        let config_altered = self.converge_config(&spec.name, &state.config, &spec.config).await?;
        Ok(TopicOutcome::Converged {
            partitions_added_to: match change {
                PartitionChange::Grown { to, .. } => Some(to),
                _ => None,
            },
            config_altered,
            shrink_refused: matches!(change, PartitionChange::ShrinkRefused { .. }),
        })
    }

    /// Delete a topic. Returns `false` when there was nothing to delete.
    pub async fn remove(&self, name: &str) -> Result<bool, TopicError> {
        if !self.exists(name).await? {
            return Ok(false);
        }
        match self.call("delete", name, self.admin.delete_topic(name)).await {
            Ok(()) => {
                info!(topic = %name, "topic deleted");
                Ok(true)
            }
            Err(TopicError::TopicNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
