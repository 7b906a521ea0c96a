//! The Kafka admin operations topic convergence relies on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kafka protocol error codes surfaced per topic.
pub mod codes {
    pub const NO_ERROR: i16 = 0;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const TOPIC_ALREADY_EXISTS: i16 = 36;
    pub const INVALID_PARTITIONS: i16 = 37;
    pub const INVALID_REPLICATION_FACTOR: i16 = 38;
    pub const INVALID_CONFIG: i16 = 40;
}

/// Topic as returned by a metadata listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDetail {
    pub partitions: i32,
    pub replication_factor: i16,
    /// Config overrides only; broker defaults are not included.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

/// Result of describing a single topic. A non-zero `error_code` is reported
/// per topic while the call itself succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub error_code: i16,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTopicOptions {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error("brokers unreachable: {0}")]
    Unreachable(String),
    #[error("broker error {code}: {message}")]
    Broker { code: i16, message: String },
}

/// Administrative API of the messaging system.
#[async_trait::async_trait]
pub trait AdminPlane: Send + Sync {
    async fn list_topics(&self) -> Result<BTreeMap<String, TopicDetail>, AdminError>;
    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicMetadata>, AdminError>;
    async fn create_topic(&self, opts: &CreateTopicOptions) -> Result<(), AdminError>;
    /// Grow `topic` to `total` partitions. `None` lets the controller pick replicas.
    async fn create_partitions(&self, topic: &str, total: i32, assignment: Option<&[Vec<i32>]>) -> Result<(), AdminError>;
    /// Replace the full set of config overrides of `topic`.
    async fn alter_topic_config(&self, topic: &str, config: &BTreeMap<String, String>) -> Result<(), AdminError>;
    async fn delete_topic(&self, topic: &str) -> Result<(), AdminError>;
}
