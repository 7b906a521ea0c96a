//! [`AdminPlane`] over librdkafka's admin client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, ConfigSource, NewPartitions, NewTopic, OwnedResourceSpecifier,
    ResourceSpecifier, TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::metadata::Metadata;
use tracing::{debug, info};

use crate::admin::{codes, AdminError, AdminPlane, CreateTopicOptions, PartitionMetadata, TopicDetail, TopicMetadata};
use crate::connect::{AdminConnection, ConnectError};

/// librdkafka settings for `conn`. TLS material is checked before use.
fn client_config(conn: &AdminConnection) -> Result<ClientConfig, ConnectError> {
    if conn.broker_uri.is_empty() {
        return Err(ConnectError::NoBroker);
    }
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", conn.broker_uri.as_str())
        .set("socket.timeout.ms", conn.operation_timeout.as_millis().max(10).to_string());
    if !conn.use_tls {
        return Ok(cfg);
    }
    cfg.set("security.protocol", "ssl");
    match &conn.tls {
        Some(tls) => {
            tls.check_key_pair()?;
            cfg.set("ssl.certificate.pem", String::from_utf8_lossy(&tls.client_cert).into_owned())
                .set("ssl.key.pem", String::from_utf8_lossy(&tls.client_key).into_owned())
                .set("ssl.ca.pem", String::from_utf8_lossy(&tls.ca_cert).into_owned());
        }
        None => {
            for (key, file) in [
                ("ssl.certificate.location", &conn.ssl_cert_file),
                ("ssl.key.location", &conn.ssl_key_file),
                ("ssl.ca.location", &conn.ssl_ca_file),
            ] {
                if let Some(path) = file {
                    cfg.set(key, path.as_str());
                }
            }
        }
    }
    if conn.insecure_skip_verify {
        cfg.set("enable.ssl.certificate.verification", "false")
            .set("ssl.endpoint.identification.algorithm", "none");
    }
    Ok(cfg)
}

/// Admin plane talking to real brokers.
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaAdmin {
    /// Build the client. No broker is contacted until the first call.
    pub fn connect(conn: &AdminConnection) -> Result<Self, ConnectError> {
        let client: AdminClient<DefaultClientContext> =
            client_config(conn)?.create().map_err(|e| ConnectError::Client { reason: e.to_string() })?;
        info!(broker = %conn.broker_uri, tls = conn.use_tls, "kafka admin client ready");
        Ok(Self { client: Arc::new(client), timeout: conn.operation_timeout })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new().request_timeout(Some(self.timeout)).operation_timeout(Some(self.timeout))
    }

    /// Cluster-wide topic metadata. The librdkafka call blocks, so it runs off the runtime.
    async fn metadata(&self) -> Result<Vec<TopicMetadata>, AdminError> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || client.inner().fetch_metadata(None, timeout).map(|md| topics_of(&md)))
            .await
            .map_err(|e| AdminError::Unreachable(e.to_string()))?
            .map_err(admin_error)
    }
}

fn topics_of(md: &Metadata) -> Vec<TopicMetadata> {
    md.topics()
        .iter()
        .map(|t| TopicMetadata {
            name: t.name().to_string(),
            error_code: t.error().map(|e| wire_code(RDKafkaErrorCode::from(e))).unwrap_or(codes::NO_ERROR),
            partitions: t
                .partitions()
                .iter()
                .map(|p| PartitionMetadata { id: p.id(), leader: p.leader(), replicas: p.replicas().to_vec(), isr: p.isr().to_vec() })
                .collect(),
        })
        .collect()
}

fn wire_code(code: RDKafkaErrorCode) -> i16 {
    code as i32 as i16
}

/// Client-side failures that say nothing about the request itself.
fn is_transport(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::NetworkException
    )
}

fn broker_error(code: RDKafkaErrorCode) -> AdminError {
    if is_transport(code) {
        return AdminError::Unreachable(code.to_string());
    }
    AdminError::Broker { code: wire_code(code), message: code.to_string() }
}

fn admin_error(err: KafkaError) -> AdminError {
    match err.rdkafka_error_code() {
        Some(code) if !is_transport(code) => broker_error(code),
        _ => AdminError::Unreachable(err.to_string()),
    }
}

/// Per-resource results come back as a list; these calls always send one resource.
fn single<T, K>(results: Vec<Result<T, (K, RDKafkaErrorCode)>>) -> Result<(), AdminError> {
    match results.into_iter().next() {
        Some(Ok(_)) => Ok(()),
        Some(Err((_, code))) => Err(broker_error(code)),
        None => Err(AdminError::Unreachable("empty admin response".to_string())),
    }
}

#[async_trait::async_trait]
impl AdminPlane for KafkaAdmin {
    async fn list_topics(&self) -> Result<BTreeMap<String, TopicDetail>, AdminError> {
        let mut out = BTreeMap::new();
        for t in self.metadata().await?.into_iter().filter(|t| t.error_code == codes::NO_ERROR) {
            let replication_factor = t.partitions.first().map(|p| p.replicas.len() as i16).unwrap_or(0);
            let partitions = i32::try_from(t.partitions.len()).unwrap_or(i32::MAX);
            out.insert(t.name, TopicDetail { partitions, replication_factor, config: BTreeMap::new() });
        }
        if out.is_empty() {
            return Ok(out);
        }
        let names: Vec<String> = out.keys().cloned().collect();
        let specs: Vec<ResourceSpecifier<'_>> = names.iter().map(|n| ResourceSpecifier::Topic(n.as_str())).collect();
        let opts = self.options();
        let described = self.client.describe_configs(&specs, &opts).await.map_err(admin_error)?;
        for resource in described {
            let resource = resource.map_err(broker_error)?;
            let OwnedResourceSpecifier::Topic(name) = &resource.specifier else { continue };
            if let Some(detail) = out.get_mut(name) {
                detail.config = resource
                    .entries
                    .iter()
                    .filter(|e| matches!(e.source, ConfigSource::DynamicTopic))
                    .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
                    .collect();
            }
        }
        debug!(topics = out.len(), "listed topics");
        Ok(out)
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicMetadata>, AdminError> {
        let mut all: BTreeMap<String, TopicMetadata> = self.metadata().await?.into_iter().map(|t| (t.name.clone(), t)).collect();
        Ok(names
            .iter()
            .map(|n| {
                all.remove(n).unwrap_or_else(|| TopicMetadata {
                    name: n.clone(),
                    error_code: codes::UNKNOWN_TOPIC_OR_PARTITION,
                    partitions: Vec::new(),
                })
            })
            .collect())
    }

    async fn create_topic(&self, opts: &CreateTopicOptions) -> Result<(), AdminError> {
        let mut topic = NewTopic::new(&opts.name, opts.partitions, TopicReplication::Fixed(i32::from(opts.replication_factor)));
        for (k, v) in &opts.config {
            topic = topic.set(k.as_str(), v.as_str());
        }
        let admin_opts = self.options();
        single(self.client.create_topics([&topic], &admin_opts).await.map_err(admin_error)?)
    }

    async fn create_partitions(&self, topic: &str, total: i32, assignment: Option<&[Vec<i32>]>) -> Result<(), AdminError> {
        let count = usize::try_from(total).map_err(|_| AdminError::Broker {
            code: codes::INVALID_PARTITIONS,
            message: format!("invalid partition count {}", total),
        })?;
        let rows: Vec<&[i32]> = assignment.unwrap_or_default().iter().map(Vec::as_slice).collect();
        let mut grow = NewPartitions::new(topic, count);
        if assignment.is_some() {
            grow = grow.assign(rows.as_slice());
        }
        let opts = self.options();
        single(self.client.create_partitions([&grow], &opts).await.map_err(admin_error)?)
    }

    async fn alter_topic_config(&self, topic: &str, config: &BTreeMap<String, String>) -> Result<(), AdminError> {
        let mut change = AlterConfig::new(ResourceSpecifier::Topic(topic));
        for (k, v) in config {
            change = change.set(k.as_str(), v.as_str());
        }
        let opts = self.options();
        single(self.client.alter_configs([&change], &opts).await.map_err(admin_error)?)
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), AdminError> {
        let opts = self.options();
        single(self.client.delete_topics(&[topic], &opts).await.map_err(admin_error)?)
    }
}
