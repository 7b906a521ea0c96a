//! Locating the observed counterpart of a desired object.

use kora_core::{
    Identity, KubeObject, LabelSet, ResourceKind, BROKER_ID_LABEL, CLUSTER_LABEL, MOUNT_PATH_ANNOTATION,
};
use kora_kubehub::ObjectPlane;
use tracing::debug;

use crate::ConvergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    ByName,
    ByLabels,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub identity: Identity,
    pub mode: ResolutionMode,
    /// `None` means create.
    pub current: Option<KubeObject>,
}

/// Computes identities and fetches the matching observed object.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    cluster_name: String,
}

impl IdentityResolver {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self { cluster_name: cluster_name.into() }
    }

    pub fn identity_of(&self, desired: &KubeObject) -> Result<Identity, ConvergeError> {
        let kind = desired.kind();
        let namespace = desired
            .namespace()
            .ok_or(ConvergeError::MissingIdentity { kind, field: "metadata.namespace" })?
            .to_string();
        if !kind.is_label_identified() {
            let name = desired.name().ok_or(ConvergeError::MissingIdentity { kind, field: "metadata.name" })?;
            return Ok(Identity::Named { namespace, name: name.to_string() });
        }
        let broker_id = desired
            .label(BROKER_ID_LABEL)
            .ok_or(ConvergeError::MissingIdentity { kind, field: "brokerId label" })?;
        let mut labels = LabelSet::new();
        labels.push((CLUSTER_LABEL.to_string(), self.cluster_name.clone()));
        labels.push((BROKER_ID_LABEL.to_string(), broker_id.to_string()));
        let discriminator = match kind {
            // An absent annotation is the empty mount path.
            ResourceKind::PersistentVolumeClaim => {
                let mount = desired.annotation(MOUNT_PATH_ANNOTATION).unwrap_or_default();
                Some((MOUNT_PATH_ANNOTATION.to_string(), mount.to_string()))
            }
            _ => None,
        };
        Ok(Identity::Labeled { namespace, labels, discriminator })
    }

    pub async fn resolve(&self, plane: &dyn ObjectPlane, desired: &KubeObject) -> Result<Resolution, ConvergeError> {
        let kind = desired.kind();
        let identity = self.identity_of(desired)?;
        let (mode, current) = match &identity {
            Identity::Named { namespace, name } => {
                let current = plane
                    .get(kind, namespace, name)
                    .await
                    .map_err(|e| ConvergeError::remote("get", kind, &identity, e))?;
                (ResolutionMode::ByName, current)
            }
            Identity::Labeled { namespace, labels, .. } => {
                debug!(kind = %kind, identity = %identity, "searching with labels, objects are named by the server");
                let candidates = plane
                    .list(kind, namespace, labels)
                    .await
                    .map_err(|e| ConvergeError::remote("list", kind, &identity, e))?;
                (ResolutionMode::ByLabels, select(kind, &identity, candidates)?)
            }
        };
        Ok(Resolution { identity, mode, current })
    }
}

/// Narrow label matches to the one object the identity denotes.
///
/// With a discriminator, candidates carrying another value (absent reads as
/// empty) are other instances under the same label set and are ignored. Two or more remaining candidates is
/// an error, never a guess.
pub fn select(kind: ResourceKind, identity: &Identity, candidates: Vec<KubeObject>) -> Result<Option<KubeObject>, ConvergeError> {
    let discriminator = match identity {
        Identity::Labeled { discriminator, .. } => discriminator.as_ref(),
        Identity::Named { .. } => None,
    };
    let mut matching: Vec<KubeObject> = match discriminator {
        Some((key, value)) => candidates.into_iter().filter(|c| c.annotation(key).unwrap_or_default() == value.as_str()).collect(),
        None => candidates,
    };
    match matching.len() {
        0 => Ok(None),
        1 => Ok(matching.pop()),
        count => Err(ConvergeError::Ambiguous { kind, identity: identity.to_string(), count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pvc(name: Option<&str>, broker: &str, mount: Option<&str>) -> KubeObject {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: name.map(Into::into),
                namespace: Some("kafka".into()),
                labels: Some(
                    [(CLUSTER_LABEL.to_string(), "x".to_string()), (BROKER_ID_LABEL.to_string(), broker.to_string())]
                        .into_iter()
                        .collect(),
                ),
                annotations: mount.map(|m| [(MOUNT_PATH_ANNOTATION.to_string(), m.to_string())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    #[test]
    fn named_kinds_use_namespace_and_name() {
        let r = IdentityResolver::new("x");
        let cm: KubeObject = ConfigMap {
            metadata: ObjectMeta { name: Some("c".into()), namespace: Some("kafka".into()), ..Default::default() },
            ..Default::default()
        }
        .into();
        assert_eq!(r.identity_of(&cm).unwrap(), Identity::Named { namespace: "kafka".into(), name: "c".into() });
    }

    #[test]
    fn labeled_kinds_use_cluster_and_broker() {
        let r = IdentityResolver::new("x");
        let id = r.identity_of(&pvc(None, "2", Some("/kafka-logs"))).unwrap();
        assert_eq!(id.to_string(), "kafka/{kafka_cr=x,brokerId=2}[mountPath=/kafka-logs]");
    }

    #[test]
    fn missing_broker_id_is_refused() {
        let r = IdentityResolver::new("x");
        let mut no_broker = pvc(None, "2", Some("/a"));
        no_broker.meta_mut().labels = None;
        assert!(matches!(r.identity_of(&no_broker), Err(ConvergeError::MissingIdentity { field: "brokerId label", .. })));
    }

    #[test]
    fn claim_without_mount_path_matches_unannotated_claims() {
        let r = IdentityResolver::new("x");
        let id = r.identity_of(&pvc(None, "2", None)).unwrap();
        assert_eq!(id.to_string(), "kafka/{kafka_cr=x,brokerId=2}[mountPath=]");

        let existing = vec![pvc(Some("p1"), "2", Some("/a")), pvc(Some("p2"), "2", None)];
        let picked = select(ResourceKind::PersistentVolumeClaim, &id, existing).unwrap().unwrap();
        assert_eq!(picked.name(), Some("p2"));

        let annotated_only = vec![pvc(Some("p1"), "2", Some("/a"))];
        assert!(select(ResourceKind::PersistentVolumeClaim, &id, annotated_only).unwrap().is_none());
    }

    #[test]
    fn discriminator_picks_one_or_none() {
        let r = IdentityResolver::new("x");
        let id = r.identity_of(&pvc(None, "2", Some("/b"))).unwrap();
        let existing = vec![pvc(Some("p1"), "2", Some("/a")), pvc(Some("p2"), "2", Some("/b"))];
        let picked = select(ResourceKind::PersistentVolumeClaim, &id, existing).unwrap().unwrap();
        assert_eq!(picked.name(), Some("p2"));

        let id_c = r.identity_of(&pvc(None, "2", Some("/c"))).unwrap();
        let existing = vec![pvc(Some("p1"), "2", Some("/a")), pvc(Some("p2"), "2", Some("/b"))];
        assert!(select(ResourceKind::PersistentVolumeClaim, &id_c, existing).unwrap().is_none());
    }

    #[test]
    fn duplicate_matches_are_ambiguous() {
        let r = IdentityResolver::new("x");
        let id = r.identity_of(&pvc(None, "2", Some("/a"))).unwrap();
        let existing = vec![pvc(Some("p1"), "2", Some("/a")), pvc(Some("p2"), "2", Some("/a"))];
        let err = select(ResourceKind::PersistentVolumeClaim, &id, existing).unwrap_err();
        assert!(matches!(err, ConvergeError::Ambiguous { count: 2, .. }));
    }
}
