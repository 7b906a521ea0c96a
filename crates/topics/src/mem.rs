//! In-memory admin plane for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::admin::{
    codes, AdminError, AdminPlane, CreateTopicOptions, PartitionMetadata, TopicDetail, TopicMetadata,
};

/// A write issued against the admin plane, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCall {
    CreateTopic(CreateTopicOptions),
    CreatePartitions { topic: String, total: i32, assignment: Option<Vec<Vec<i32>>> },
    AlterConfig { topic: String, config: BTreeMap<String, String> },
    DeleteTopic(String),
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, TopicDetail>,
    calls: Vec<AdminCall>,
    unreachable: bool,
    latency: Option<Duration>,
}

/// [`AdminPlane`] over a map of topics. Brokers are numbered `0..replication_factor`.
#[derive(Default)]
pub struct MemAdmin {
    state: Mutex<State>,
}

impl MemAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a topic without recording a call.
    pub fn with_topic(self, name: &str, partitions: i32, replication_factor: i16) -> Self {
        self.lock()
            .topics
            .insert(name.to_string(), TopicDetail { partitions, replication_factor, config: BTreeMap::new() });
        self
    }

    pub fn set_config(&self, topic: &str, key: &str, value: &str) {
        if let Some(t) = self.lock().topics.get_mut(topic) {
            t.config.insert(key.to_string(), value.to_string());
        }
    }

    pub fn topic(&self, name: &str) -> Option<TopicDetail> {
        self.lock().topics.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<AdminCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn set_unreachable(&self, on: bool) {
        self.lock().unreachable = on;
    }

    /// Delay every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    async fn enter(&self) -> Result<MutexGuard<'_, State>, AdminError> {
        let latency = self.lock().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        let st = self.lock();
        if st.unreachable {
            return Err(AdminError::Unreachable("no broker answered".into()));
        }
        Ok(st)
    }
}

fn broker_err(code: i16, message: impl Into<String>) -> AdminError {
    AdminError::Broker { code, message: message.into() }
}

#[async_trait::async_trait]
impl AdminPlane for MemAdmin {
    async fn list_topics(&self) -> Result<BTreeMap<String, TopicDetail>, AdminError> {
        Ok(self.enter().await?.topics.clone())
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicMetadata>, AdminError> {
        let st = self.enter().await?;
        Ok(names
            .iter()
            .map(|name| match st.topics.get(name) {
                Some(t) => {
                    let replicas: Vec<i32> = (0..i32::from(t.replication_factor)).collect();
                    TopicMetadata {
                        name: name.clone(),
                        error_code: codes::NO_ERROR,
                        partitions: (0..t.partitions)
                            .map(|id| PartitionMetadata { id, leader: 0, replicas: replicas.clone(), isr: replicas.clone() })
                            .collect(),
                    }
                }
                None => TopicMetadata { name: name.clone(), error_code: codes::UNKNOWN_TOPIC_OR_PARTITION, partitions: vec![] },
            })
            .collect())
    }

    async fn create_topic(&self, opts: &CreateTopicOptions) -> Result<(), AdminError> {
        let mut st = self.enter().await?;
        if st.topics.contains_key(&opts.name) {
            return Err(broker_err(codes::TOPIC_ALREADY_EXISTS, format!("topic '{}' already exists", opts.name)));
        }
        if opts.partitions < 1 {
            return Err(broker_err(codes::INVALID_PARTITIONS, "number of partitions must be larger than 0"));
        }
        if opts.replication_factor < 1 {
            return Err(broker_err(codes::INVALID_REPLICATION_FACTOR, "replication factor must be larger than 0"));
        }
        debug!(topic = %opts.name, partitions = opts.partitions, "mem create topic");
        st.calls.push(AdminCall::CreateTopic(opts.clone()));
        st.topics.insert(
            opts.name.clone(),
            TopicDetail { partitions: opts.partitions, replication_factor: opts.replication_factor, config: opts.config.clone() },
        );
        Ok(())
    }

    async fn create_partitions(&self, topic: &str, total: i32, assignment: Option<&[Vec<i32>]>) -> Result<(), AdminError> {
        let mut st = self.enter().await?;
        let current = st
            .topics
            .get(topic)
            .map(|t| t.partitions)
            .ok_or_else(|| broker_err(codes::UNKNOWN_TOPIC_OR_PARTITION, format!("topic '{}' does not exist", topic)))?;
        if total <= current {
            return Err(broker_err(
                codes::INVALID_PARTITIONS,
                format!("topic currently has {} partitions, {} would not be an increase", current, total),
            ));
        }
        st.calls.push(AdminCall::CreatePartitions { topic: topic.to_string(), total, assignment: assignment.map(<[_]>::to_vec) });
        if let Some(t) = st.topics.get_mut(topic) {
            t.partitions = total;
        }
        Ok(())
    }

    async fn alter_topic_config(&self, topic: &str, config: &BTreeMap<String, String>) -> Result<(), AdminError> {
        let mut st = self.enter().await?;
        if !st.topics.contains_key(topic) {
            return Err(broker_err(codes::UNKNOWN_TOPIC_OR_PARTITION, format!("topic '{}' does not exist", topic)));
        }
        st.calls.push(AdminCall::AlterConfig { topic: topic.to_string(), config: config.clone() });
        if let Some(t) = st.topics.get_mut(topic) {
            t.config = config.clone();
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), AdminError> {
        let mut st = self.enter().await?;
        if st.topics.remove(topic).is_none() {
            return Err(broker_err(codes::UNKNOWN_TOPIC_OR_PARTITION, format!("topic '{}' does not exist", topic)));
        }
        st.calls.push(AdminCall::DeleteTopic(topic.to_string()));
        Ok(())
    }
}
