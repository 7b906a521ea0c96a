//! Broker placement write-back.
//!
//! A broker pod is recreated rather than patched. Before the old pod goes away
//! its observed node is pinned in the cluster resource so that the replacement
//! is scheduled next to the broker's existing volumes.

use std::time::Duration;

use k8s_openapi::api::core::v1::{NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod};
use kora_kubehub::{PlaneError, DEFAULT_OPERATION_TIMEOUT};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::info;

/// Node label used to pin a broker to the node it ran on.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Node affinity to keep for a pod: the declared one if the pod had it,
/// otherwise one pinning the node the scheduler picked.
pub fn observed_affinity(pod: &Pod) -> Option<NodeAffinity> {
    let spec = pod.spec.as_ref()?;
    if let Some(declared) = spec.affinity.as_ref().and_then(|a| a.node_affinity.clone()) {
        return Some(declared);
    }
    let node = spec.node_name.clone()?;
    Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![node]),
                }]),
                match_fields: None,
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    })
}

/// Destination of a broker's observed placement.
#[async_trait::async_trait]
pub trait PlacementRecorder: Send + Sync {
    async fn record(&self, namespace: &str, broker_id: &str, affinity: &NodeAffinity) -> Result<(), PlaneError>;
}

/// Drops placement; pods may land anywhere after a recreate.
pub struct NoPlacement;

#[async_trait::async_trait]
impl PlacementRecorder for NoPlacement {
    async fn record(&self, _namespace: &str, _broker_id: &str, _affinity: &NodeAffinity) -> Result<(), PlaneError> {
        Ok(())
    }
}

/// Merge-patches `spec.brokerPlacement.<brokerId>.nodeAffinity` on the cluster custom resource.
pub struct ClusterResourcePlacement {
    client: Client,
    cluster_name: String,
    resource: ApiResource,
    timeout: Duration,
}

impl ClusterResourcePlacement {
    pub fn new(client: Client, cluster_name: impl Into<String>) -> Self {
        let gvk = GroupVersionKind::gvk("kafka.banzaicloud.io", "v1alpha1", "KafkaCluster");
        Self {
            client,
            cluster_name: cluster_name.into(),
            resource: ApiResource::from_gvk(&gvk),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// JSON merge patch body for one broker.
pub fn placement_patch(broker_id: &str, affinity: &NodeAffinity) -> serde_json::Value {
    let mut per_broker = serde_json::Map::new();
    per_broker.insert(broker_id.to_string(), serde_json::json!({ "nodeAffinity": affinity }));
    serde_json::json!({ "spec": { "brokerPlacement": per_broker } })
}

#[async_trait::async_trait]
impl PlacementRecorder for ClusterResourcePlacement {
    async fn record(&self, namespace: &str, broker_id: &str, affinity: &NodeAffinity) -> Result<(), PlaneError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.resource);
        let patch = placement_patch(broker_id, affinity);
        let pp = PatchParams::default();
        let merge = Patch::Merge(&patch);
        match tokio::time::timeout(self.timeout, api.patch(&self.cluster_name, &pp, &merge)).await {
            Ok(res) => {
                res?;
                info!(cluster = %self.cluster_name, broker_id, "broker placement recorded");
                Ok(())
            }
            Err(_) => Err(PlaneError::Timeout(self.timeout)),
        }
    }
}
