//! Kora kubehub: the narrow slice of the Kubernetes API the convergence engine uses.
//!
//! [`ObjectPlane`] is the seam: [`KubePlane`] talks to a live API server through
//! kube-rs, [`MemPlane`] keeps objects in memory and records every write.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kora_core::{KubeObject, ResourceKind};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

mod mem;

pub use mem::{MemPlane, WriteCall};

/// Default bound on a single remote call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl PlaneError {
    /// Errors expected to clear up by re-running the pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlaneError::Conflict(_) | PlaneError::Unavailable(_) | PlaneError::Timeout(_))
    }
}

impl From<kube::Error> for PlaneError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => PlaneError::NotFound,
                409 => PlaneError::Conflict(ae.message),
                429 | 500..=599 => PlaneError::Unavailable(ae.message),
                code => PlaneError::Rejected { code, message: ae.message },
            },
            kube::Error::SerdeError(e) => PlaneError::Codec(e),
            other => PlaneError::Unavailable(other.to_string()),
        }
    }
}

/// Knobs for a plane. Read from the environment only at the edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneConfig {
    pub operation_timeout: Duration,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self { operation_timeout: DEFAULT_OPERATION_TIMEOUT }
    }
}

impl PlaneConfig {
    /// `KORA_OPERATION_TIMEOUT_SECS` overrides the per-call timeout.
    pub fn from_env() -> Self {
        let operation_timeout = match std::env::var("KORA_OPERATION_TIMEOUT_SECS") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %raw, "invalid KORA_OPERATION_TIMEOUT_SECS; using default");
                    DEFAULT_OPERATION_TIMEOUT
                }
            },
            Err(_) => DEFAULT_OPERATION_TIMEOUT,
        };
        Self { operation_timeout }
    }
}

/// Render label pairs as a Kubernetes equality selector.
pub fn selector_string(labels: &[(String, String)]) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Point and label lookups plus writes against the orchestration plane.
/// Every object carries its `resourceVersion`; `replace` must send the one it read.
#[async_trait::async_trait]
pub trait ObjectPlane: Send + Sync {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<KubeObject>, PlaneError>;

    async fn list(&self, kind: ResourceKind, namespace: &str, labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError>;

    /// Create and return the object as stored by the server.
    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError>;

    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), PlaneError>;
}

trait Managed:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + fmt::Debug
    + Send
    + Sync
    + Into<KubeObject>
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + Into<KubeObject>
        + 'static
{
}

/// [`ObjectPlane`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubePlane {
    client: Client,
    cfg: PlaneConfig,
}

impl KubePlane {
    pub fn new(client: Client, cfg: PlaneConfig) -> Self {
        Self { client, cfg }
    }

    /// Build from the ambient kubeconfig / in-cluster service account.
    pub async fn try_default(cfg: PlaneConfig) -> Result<Self, PlaneError> {
        let client = Client::try_default().await?;
        info!(timeout_s = cfg.operation_timeout.as_secs(), "kube plane ready");
        Ok(Self::new(client, cfg))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T, kube::Error>>) -> Result<T, PlaneError> {
        counter!("plane_calls_total", 1u64, "op" => op);
        match tokio::time::timeout(self.cfg.operation_timeout, fut).await {
            Ok(res) => res.map_err(PlaneError::from),
            Err(_) => {
                counter!("plane_timeouts_total", 1u64, "op" => op);
                Err(PlaneError::Timeout(self.cfg.operation_timeout))
            }
        }
    }

    async fn get_typed<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<KubeObject>, PlaneError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let got = self.bounded("get", api.get_opt(name)).await?;
        Ok(got.map(Into::into))
    }

    async fn list_typed<K: Managed>(&self, namespace: &str, labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector_string(labels));
        let list = self.bounded("list", api.list(&lp)).await?;
        debug!(count = list.items.len(), "listed by labels");
        Ok(list.items.into_iter().map(Into::into).collect())
    }

    async fn create_typed<K: Managed>(&self, obj: &K) -> Result<KubeObject, PlaneError> {
        let ns = obj.meta().namespace.clone().ok_or_else(|| PlaneError::Invalid("metadata.namespace missing".into()))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        let created = self.bounded("create", api.create(&PostParams::default(), obj)).await?;
        Ok(created.into())
    }

    async fn replace_typed<K: Managed>(&self, obj: &K) -> Result<KubeObject, PlaneError> {
        let meta = obj.meta();
        let ns = meta.namespace.clone().ok_or_else(|| PlaneError::Invalid("metadata.namespace missing".into()))?;
        let name = meta.name.clone().ok_or_else(|| PlaneError::Invalid("metadata.name missing".into()))?;
        if meta.resource_version.is_none() {
            return Err(PlaneError::Invalid("replace without resourceVersion".into()));
        }
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        let replaced = self.bounded("replace", api.replace(&name, &PostParams::default(), obj)).await?;
        Ok(replaced.into())
    }

    async fn delete_typed<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), PlaneError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("delete", api.delete(name, &DeleteParams::default())).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectPlane for KubePlane {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<KubeObject>, PlaneError> {
        match kind {
            ResourceKind::ConfigMap => self.get_typed::<ConfigMap>(namespace, name).await,
            ResourceKind::Service => self.get_typed::<Service>(namespace, name).await,
            ResourceKind::Pod => self.get_typed::<Pod>(namespace, name).await,
            ResourceKind::PersistentVolumeClaim => self.get_typed::<PersistentVolumeClaim>(namespace, name).await,
            ResourceKind::Deployment => self.get_typed::<Deployment>(namespace, name).await,
            ResourceKind::StatefulSet => self.get_typed::<StatefulSet>(namespace, name).await,
        }
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError> {
        match kind {
            ResourceKind::ConfigMap => self.list_typed::<ConfigMap>(namespace, labels).await,
            ResourceKind::Service => self.list_typed::<Service>(namespace, labels).await,
            ResourceKind::Pod => self.list_typed::<Pod>(namespace, labels).await,
            ResourceKind::PersistentVolumeClaim => self.list_typed::<PersistentVolumeClaim>(namespace, labels).await,
            ResourceKind::Deployment => self.list_typed::<Deployment>(namespace, labels).await,
            ResourceKind::StatefulSet => self.list_typed::<StatefulSet>(namespace, labels).await,
        }
    }

    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        match obj {
            KubeObject::ConfigMap(o) => self.create_typed(o).await,
            KubeObject::Service(o) => self.create_typed(o).await,
            KubeObject::Pod(o) => self.create_typed(o).await,
            KubeObject::PersistentVolumeClaim(o) => self.create_typed(o).await,
            KubeObject::Deployment(o) => self.create_typed(o).await,
            KubeObject::StatefulSet(o) => self.create_typed(o).await,
        }
    }

    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        match obj {
            KubeObject::ConfigMap(o) => self.replace_typed(o).await,
            KubeObject::Service(o) => self.replace_typed(o).await,
            KubeObject::Pod(o) => self.replace_typed(o).await,
            KubeObject::PersistentVolumeClaim(o) => self.replace_typed(o).await,
            KubeObject::Deployment(o) => self.replace_typed(o).await,
            KubeObject::StatefulSet(o) => self.replace_typed(o).await,
        }
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), PlaneError> {
        match kind {
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(namespace, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(namespace, name).await,
            ResourceKind::Pod => self.delete_typed::<Pod>(namespace, name).await,
            ResourceKind::PersistentVolumeClaim => self.delete_typed::<PersistentVolumeClaim>(namespace, name).await,
            ResourceKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            ResourceKind::StatefulSet => self.delete_typed::<StatefulSet>(namespace, name).await,
        }
    }
}
