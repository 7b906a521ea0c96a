use serde::{Deserialize, Serialize};

/// An internal (in-cluster) broker listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub container_port: i32,
}

/// The slice of a declared Kafka cluster the convergence core needs: naming,
/// addressing and where its TLS client material lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    /// uid of the cluster custom resource, used for owner references when known.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub headless_service_enabled: bool,
    pub internal_listeners: Vec<Listener>,
    #[serde(default)]
    pub tls_secret_name: Option<String>,
}

impl ClusterRef {
    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.name)
    }

    pub fn all_broker_service_name(&self) -> String {
        format!("{}-all-broker", self.name)
    }

    pub fn cruise_control_service_name(&self) -> String {
        format!("{}-cruisecontrol-svc", self.name)
    }

    pub fn issuer_name(&self) -> String {
        format!("{}-issuer", self.name)
    }
}
