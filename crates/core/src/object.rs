//! The closed set of Kubernetes kinds the convergence engine manages.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Tag of a [`KubeObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    ConfigMap,
    Service,
    Pod,
    PersistentVolumeClaim,
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::ConfigMap,
        ResourceKind::Service,
        ResourceKind::Pod,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
    ];

    /// Kubernetes `kind` string.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Service => "Service",
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Kinds whose objects get their names from the server and are found by
    /// broker labels instead.
    pub fn is_label_identified(self) -> bool {
        matches!(self, ResourceKind::Pod | ResourceKind::PersistentVolumeClaim)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectCodecError {
    #[error("manifest has no kind")]
    MissingKind,
    #[error("unmanaged kind: {0}")]
    UnknownKind(String),
    #[error("decoding {kind}: {source}")]
    Json { kind: ResourceKind, source: serde_json::Error },
}

/// A typed Kubernetes object of one of the managed kinds. Used both for the
/// caller's desired object and for what the API server currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum KubeObject {
    ConfigMap(ConfigMap),
    Service(Service),
    Pod(Pod),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

macro_rules! with_inner {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            KubeObject::ConfigMap($inner) => $body,
            KubeObject::Service($inner) => $body,
            KubeObject::Pod($inner) => $body,
            KubeObject::PersistentVolumeClaim($inner) => $body,
            KubeObject::Deployment($inner) => $body,
            KubeObject::StatefulSet($inner) => $body,
        }
    };
}

macro_rules! impl_from {
    ($($ty:ident),*) => {
        $(impl From<$ty> for KubeObject {
            fn from(v: $ty) -> Self { KubeObject::$ty(v) }
        })*
    };
}

impl_from!(ConfigMap, Service, Pod, PersistentVolumeClaim, Deployment, StatefulSet);

impl KubeObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            KubeObject::ConfigMap(_) => ResourceKind::ConfigMap,
            KubeObject::Service(_) => ResourceKind::Service,
            KubeObject::Pod(_) => ResourceKind::Pod,
            KubeObject::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            KubeObject::Deployment(_) => ResourceKind::Deployment,
            KubeObject::StatefulSet(_) => ResourceKind::StatefulSet,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        with_inner!(self, o => &o.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        with_inner!(self, o => &mut o.metadata)
    }

    pub fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    /// True when every `(key, value)` pair is present in the object's labels.
    pub fn has_labels(&self, wanted: &[(String, String)]) -> bool {
        let empty = BTreeMap::new();
        let labels = self.meta().labels.as_ref().unwrap_or(&empty);
        wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Full JSON rendering including `apiVersion` and `kind`.
    pub fn to_json(&self) -> Result<Json, serde_json::Error> {
        with_inner!(self, o => serde_json::to_value(o))
    }

    /// Decode a manifest (as produced by `kubectl get -o json` or a YAML file)
    /// into one of the managed kinds.
    pub fn from_manifest(value: Json) -> Result<Self, ObjectCodecError> {
        let kind_s = value.get("kind").and_then(|v| v.as_str()).ok_or(ObjectCodecError::MissingKind)?;
        let kind = ResourceKind::from_kind(kind_s).ok_or_else(|| ObjectCodecError::UnknownKind(kind_s.to_string()))?;
        let codec = |source| ObjectCodecError::Json { kind, source };
        Ok(match kind {
            ResourceKind::ConfigMap => KubeObject::ConfigMap(serde_json::from_value(value).map_err(codec)?),
            ResourceKind::Service => KubeObject::Service(serde_json::from_value(value).map_err(codec)?),
            ResourceKind::Pod => KubeObject::Pod(serde_json::from_value(value).map_err(codec)?),
            ResourceKind::PersistentVolumeClaim => KubeObject::PersistentVolumeClaim(serde_json::from_value(value).map_err(codec)?),
            ResourceKind::Deployment => KubeObject::Deployment(serde_json::from_value(value).map_err(codec)?),
            ResourceKind::StatefulSet => KubeObject::StatefulSet(serde_json::from_value(value).map_err(codec)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for k in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_kind(k.as_str()), Some(k));
        }
        assert_eq!(ResourceKind::from_kind("Secret"), None);
    }

    #[test]
    fn manifest_decodes_into_typed_variant() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "broker-config", "namespace": "kafka", "labels": { "kafka_cr": "x" } },
            "data": { "server.properties": "broker.id=0" }
        });
        let obj = KubeObject::from_manifest(v).unwrap();
        assert_eq!(obj.kind(), ResourceKind::ConfigMap);
        assert_eq!(obj.name(), Some("broker-config"));
        assert_eq!(obj.label("kafka_cr"), Some("x"));
        assert!(obj.has_labels(&[("kafka_cr".into(), "x".into())]));
        assert!(!obj.has_labels(&[("brokerId".into(), "0".into())]));
    }

    #[test]
    fn manifest_with_unmanaged_kind_is_refused() {
        let v = serde_json::json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "s" } });
        let err = KubeObject::from_manifest(v).unwrap_err();
        assert!(matches!(err, ObjectCodecError::UnknownKind(ref k) if k == "Secret"));
        let err = KubeObject::from_manifest(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ObjectCodecError::MissingKind));
    }
}
