//! Cluster-level services the operator keeps in place for every Kafka cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kora_core::{ClusterRef, KubeObject, CLUSTER_LABEL};

use crate::scale::CRUISE_CONTROL_PORT;

fn labels(app: &str, cluster: &ClusterRef) -> BTreeMap<String, String> {
    [("app".to_string(), app.to_string()), (CLUSTER_LABEL.to_string(), cluster.name.clone())]
        .into_iter()
        .collect()
}

fn owner(cluster: &ClusterRef) -> Option<Vec<OwnerReference>> {
    let uid = cluster.uid.clone()?;
    Some(vec![OwnerReference {
        api_version: "kafka.banzaicloud.io/v1alpha1".into(),
        kind: "KafkaCluster".into(),
        name: cluster.name.clone(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    }])
}

fn meta(name: String, app: &str, cluster: &ClusterRef) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace.clone()),
        labels: Some(labels(app, cluster)),
        owner_references: owner(cluster),
        ..Default::default()
    }
}

/// Headless service giving every broker a stable DNS name.
/// Port names are the listener names without underscores (not valid in a port name).
pub fn headless_service(cluster: &ClusterRef) -> KubeObject {
    let ports = cluster
        .internal_listeners
        .iter()
        .map(|l| ServicePort {
            name: Some(l.name.replace('_', "")),
            port: l.container_port,
            target_port: Some(IntOrString::Int(l.container_port)),
            protocol: Some("TCP".into()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: meta(cluster.headless_service_name(), "kafka", cluster),
        spec: Some(ServiceSpec {
            selector: Some(labels("kafka", cluster)),
            cluster_ip: Some("None".into()),
            session_affinity: Some("None".into()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
    .into()
}

pub fn cruise_control_service(cluster: &ClusterRef) -> KubeObject {
    let port = i32::from(CRUISE_CONTROL_PORT);
    Service {
        metadata: meta(cluster.cruise_control_service_name(), "cruisecontrol", cluster),
        spec: Some(ServiceSpec {
            selector: Some(labels("cruisecontrol", cluster)),
            ports: Some(vec![ServicePort {
                name: Some("cc".into()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kora_core::Listener;

    fn cluster(uid: Option<&str>) -> ClusterRef {
        ClusterRef {
            name: "x".into(),
            namespace: "kafka".into(),
            uid: uid.map(Into::into),
            headless_service_enabled: true,
            internal_listeners: vec![
                Listener { name: "internal_plain".into(), container_port: 29092 },
                Listener { name: "controller".into(), container_port: 29093 },
            ],
            tls_secret_name: None,
        }
    }

    #[test]
    fn headless_ports_follow_listeners() {
        let KubeObject::Service(svc) = headless_service(&cluster(None)) else { panic!("not a service") };
        assert_eq!(svc.metadata.name.as_deref(), Some("x-headless"));
        assert!(svc.metadata.owner_references.is_none());
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].name.as_deref(), Some("internalplain"));
        assert_eq!(ports[1].port, 29093);
        assert_eq!(spec.selector.unwrap().get(CLUSTER_LABEL).map(String::as_str), Some("x"));
    }

    #[test]
    fn owner_reference_when_uid_known() {
        let obj = cruise_control_service(&cluster(Some("u-1")));
        assert_eq!(obj.name(), Some("x-cruisecontrol-svc"));
        let owners = obj.meta().owner_references.clone().unwrap();
        assert_eq!(owners[0].uid, "u-1");
        assert_eq!(owners[0].kind, "KafkaCluster");
    }
}
