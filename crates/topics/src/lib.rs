//! Kora topics: converge Kafka topics (partitions, config overrides) through an admin plane.

#![forbid(unsafe_code)]

pub mod admin;
pub mod connect;
mod converge;
#[cfg(feature = "kafka")]
mod kafka;
mod mem;

pub use admin::{AdminError, AdminPlane, CreateTopicOptions, PartitionMetadata, TopicDetail, TopicMetadata};
pub use connect::{AdminConnection, ConnectError, ConnectionSummary, KubeSecrets, SecretSource, TlsMaterial};
pub use converge::{PartitionChange, TopicConverger, TopicError, TopicOutcome, TopicSpec, TopicState, DEFAULT_ADMIN_TIMEOUT};
#[cfg(feature = "kafka")]
pub use kafka::KafkaAdmin;
pub use mem::{AdminCall, MemAdmin};
