//! In-memory object plane. Behaves like the API server where the engine cares:
//! assigns names for `generateName`, bumps `resourceVersion` on every write,
//! rejects stale replaces, keeps a service's cluster IP immutable, and adds
//! the service-account volume and default tolerations to every pod.

use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{PodSpec, ProjectedVolumeSource, Toleration, Volume, VolumeMount};
use kora_core::{KubeObject, ResourceKind};
use tracing::debug;
use uuid::Uuid;

use crate::{ObjectPlane, PlaneError};

/// A write observed by the plane, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCall {
    Create { kind: ResourceKind, namespace: String, name: String },
    Replace { kind: ResourceKind, namespace: String, name: String },
    Delete { kind: ResourceKind, namespace: String, name: String },
}

impl WriteCall {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WriteCall::Create { kind, .. } | WriteCall::Replace { kind, .. } | WriteCall::Delete { kind, .. } => *kind,
        }
    }
}

#[derive(Default)]
struct MemState {
    objects: Vec<KubeObject>,
    next_rv: u64,
    next_suffix: u64,
    writes: Vec<WriteCall>,
    unavailable: bool,
}

impl MemState {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn position(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<usize> {
        self.objects
            .iter()
            .position(|o| o.kind() == kind && o.namespace() == Some(namespace) && o.name() == Some(name))
    }

    /// Fill in what the API server assigns on admission.
    fn admit(&mut self, mut obj: KubeObject) -> Result<KubeObject, PlaneError> {
        if obj.namespace().is_none() {
            return Err(PlaneError::Invalid("metadata.namespace missing".into()));
        }
        if obj.name().is_none() {
            let prefix = obj
                .meta()
                .generate_name
                .clone()
                .ok_or_else(|| PlaneError::Invalid("metadata.name or generateName required".into()))?;
            self.next_suffix += 1;
            obj.meta_mut().name = Some(format!("{}{:05}", prefix, self.next_suffix));
        }
        let rv = self.bump_rv();
        let meta = obj.meta_mut();
        meta.resource_version = Some(rv);
        meta.uid = Some(Uuid::new_v4().to_string());
        match &mut obj {
            KubeObject::Service(svc) => {
                if let Some(spec) = svc.spec.as_mut() {
                    if spec.cluster_ip.is_none() {
                        let ip = format!("10.96.0.{}", self.next_rv % 250 + 1);
                        spec.cluster_ips = Some(vec![ip.clone()]);
                        spec.cluster_ip = Some(ip);
                    }
                }
            }
            KubeObject::Pod(pod) => {
                if let Some(spec) = pod.spec.as_mut() {
                    admit_pod(spec, self.next_rv);
                }
            }
            _ => {}
        }
        Ok(obj)
    }
}

const TOKEN_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_TOLERATIONS: [&str; 2] = ["node.kubernetes.io/not-ready", "node.kubernetes.io/unreachable"];

/// Service-account token volume and the default NoExecute tolerations.
fn admit_pod(spec: &mut PodSpec, seed: u64) {
    if spec.automount_service_account_token != Some(false) {
        let volume = format!("kube-api-access-{:05x}", seed);
        spec.volumes
            .get_or_insert_with(Vec::new)
            .push(Volume { name: volume.clone(), projected: Some(ProjectedVolumeSource::default()), ..Default::default() });
        for c in spec.containers.iter_mut() {
            c.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
                name: volume.clone(),
                mount_path: TOKEN_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }
    let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
    for key in DEFAULT_TOLERATIONS {
        if !tolerations.iter().any(|t| t.key.as_deref() == Some(key)) {
            tolerations.push(Toleration {
                key: Some(key.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoExecute".to_string()),
                toleration_seconds: Some(300),
                ..Default::default()
            });
        }
    }
}

/// [`ObjectPlane`] holding objects in memory; every write is recorded.
#[derive(Default)]
pub struct MemPlane {
    state: Mutex<MemState>,
}

impl MemPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with objects as if created by someone else earlier.
    pub fn with_objects(objects: impl IntoIterator<Item = KubeObject>) -> Self {
        let plane = Self::new();
        for o in objects {
            plane.insert(o);
        }
        plane
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object without recording a write. Server fields are filled in.
    pub fn insert(&self, obj: KubeObject) -> KubeObject {
        let mut st = self.lock();
        let stored = match st.admit(obj.clone()) {
            Ok(o) => o,
            Err(_) => obj,
        };
        st.objects.push(stored.clone());
        stored
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<KubeObject> {
        self.lock().objects.iter().filter(|o| o.kind() == kind).cloned().collect()
    }

    /// Make every call fail as if the API server were unreachable.
    pub fn set_unavailable(&self, on: bool) {
        self.lock().unavailable = on;
    }

    /// Simulate a concurrent writer touching the stored object.
    pub fn touch(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut st = self.lock();
        if let Some(idx) = st.position(kind, namespace, name) {
            let rv = st.bump_rv();
            if let Some(o) = st.objects.get_mut(idx) {
                o.meta_mut().resource_version = Some(rv);
            }
        }
    }

    fn check_available(st: &MemState) -> Result<(), PlaneError> {
        if st.unavailable { Err(PlaneError::Unavailable("connection refused".into())) } else { Ok(()) }
    }
}

fn key_of(obj: &KubeObject) -> Result<(String, String), PlaneError> {
    let ns = obj.namespace().ok_or_else(|| PlaneError::Invalid("metadata.namespace missing".into()))?;
    let name = obj.name().ok_or_else(|| PlaneError::Invalid("metadata.name missing".into()))?;
    Ok((ns.to_string(), name.to_string()))
}

#[async_trait::async_trait]
impl ObjectPlane for MemPlane {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<KubeObject>, PlaneError> {
        let st = self.lock();
        Self::check_available(&st)?;
        Ok(st.position(kind, namespace, name).and_then(|i| st.objects.get(i).cloned()))
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError> {
        let st = self.lock();
        Self::check_available(&st)?;
        Ok(st
            .objects
            .iter()
            .filter(|o| o.kind() == kind && o.namespace() == Some(namespace) && o.has_labels(labels))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        let mut st = self.lock();
        Self::check_available(&st)?;
        if let (Some(ns), Some(name)) = (obj.namespace(), obj.name()) {
            if st.position(obj.kind(), ns, name).is_some() {
                return Err(PlaneError::Conflict(format!("{} {}/{} already exists", obj.kind(), ns, name)));
            }
        }
        let stored = st.admit(obj.clone())?;
        let (namespace, name) = key_of(&stored)?;
        debug!(kind = %stored.kind(), ns = %namespace, name = %name, "mem create");
        st.writes.push(WriteCall::Create { kind: stored.kind(), namespace, name });
        st.objects.push(stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        let mut st = self.lock();
        Self::check_available(&st)?;
        let (namespace, name) = key_of(obj)?;
        let kind = obj.kind();
        let idx = st.position(kind, &namespace, &name).ok_or(PlaneError::NotFound)?;
        let current = st.objects.get(idx).cloned().ok_or(PlaneError::NotFound)?;
        if obj.resource_version() != current.resource_version() {
            return Err(PlaneError::Conflict(format!(
                "{} {}/{}: resourceVersion {:?} is stale (current {:?})",
                kind,
                namespace,
                name,
                obj.resource_version(),
                current.resource_version()
            )));
        }
        let mut next = obj.clone();
        if let (KubeObject::Service(new), KubeObject::Service(old)) = (&mut next, &current) {
            if let (Some(ns), Some(os)) = (new.spec.as_mut(), old.spec.as_ref()) {
                match (&ns.cluster_ip, &os.cluster_ip) {
                    (None, _) => {
                        ns.cluster_ip = os.cluster_ip.clone();
                        ns.cluster_ips = os.cluster_ips.clone();
                    }
                    (Some(a), Some(b)) if a != b => {
                        return Err(PlaneError::Rejected { code: 422, message: "spec.clusterIP: field is immutable".into() });
                    }
                    _ => {}
                }
            }
        }
        let rv = st.bump_rv();
        let meta = next.meta_mut();
        meta.resource_version = Some(rv);
        meta.uid = current.meta().uid.clone();
        st.writes.push(WriteCall::Replace { kind, namespace, name });
        if let Some(slot) = st.objects.get_mut(idx) {
            *slot = next.clone();
        }
        Ok(next)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), PlaneError> {
        let mut st = self.lock();
        Self::check_available(&st)?;
        let idx = st.position(kind, namespace, name).ok_or(PlaneError::NotFound)?;
        st.objects.remove(idx);
        st.writes.push(WriteCall::Delete { kind, namespace: namespace.to_string(), name: name.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, Service, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(name: &str) -> KubeObject {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("kafka".into()), ..Default::default() },
            ..Default::default()
        }
        .into()
    }

    #[tokio::test]
    async fn stale_replace_is_a_conflict() {
        let plane = MemPlane::new();
        let stored = plane.create(&cm("a")).await.unwrap();
        plane.touch(ResourceKind::ConfigMap, "kafka", "a");
        let err = plane.replace(&stored).await.unwrap_err();
        assert!(matches!(err, PlaneError::Conflict(_)));
        assert_eq!(plane.writes().len(), 1);
    }

    #[tokio::test]
    async fn generate_name_gets_a_suffix() {
        let plane = MemPlane::new();
        let mut obj = cm("unused");
        obj.meta_mut().name = None;
        obj.meta_mut().generate_name = Some("x-2-".into());
        let stored = plane.create(&obj).await.unwrap();
        assert!(stored.name().unwrap().starts_with("x-2-"));
        assert!(stored.resource_version().is_some());
    }

    #[tokio::test]
    async fn service_cluster_ip_is_immutable() {
        let plane = MemPlane::new();
        let svc: KubeObject = Service {
            metadata: ObjectMeta { name: Some("s".into()), namespace: Some("kafka".into()), ..Default::default() },
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        }
        .into();
        let mut stored = plane.create(&svc).await.unwrap();
        if let KubeObject::Service(s) = &mut stored {
            s.spec.as_mut().unwrap().cluster_ip = Some("1.2.3.4".into());
        }
        let err = plane.replace(&stored).await.unwrap_err();
        assert!(matches!(err, PlaneError::Rejected { code: 422, .. }));
    }

    #[tokio::test]
    async fn pods_get_token_volume_and_tolerations() {
        let pod: KubeObject = Pod {
            metadata: ObjectMeta { name: Some("p".into()), namespace: Some("kafka".into()), ..Default::default() },
            spec: Some(PodSpec { containers: vec![Container { name: "kafka".into(), ..Default::default() }], ..Default::default() }),
            ..Default::default()
        }
        .into();
        let KubeObject::Pod(stored) = MemPlane::new().create(&pod).await.unwrap() else { panic!("not a pod") };
        let spec = stored.spec.unwrap();
        let volume = &spec.volumes.unwrap()[0].name;
        assert!(volume.starts_with("kube-api-access-"));
        assert_eq!(spec.containers[0].volume_mounts.as_ref().unwrap()[0].name, *volume);
        assert_eq!(spec.tolerations.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_plane_fails_reads() {
        let plane = MemPlane::with_objects([cm("a")]);
        plane.set_unavailable(true);
        let err = plane.get(ResourceKind::ConfigMap, "kafka", "a").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
