//! Kora core types: managed kinds, object identities, merge decisions and pass outcomes.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::core::v1::NodeAffinity;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod cluster;
mod object;

pub use cluster::{ClusterRef, Listener};
pub use object::{KubeObject, ObjectCodecError, ResourceKind};

/// Label carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "kafka_cr";
/// Label carrying the stable broker id of pods and volume claims.
pub const BROKER_ID_LABEL: &str = "brokerId";
/// Annotation telling apart the volume claims of a single broker.
pub const MOUNT_PATH_ANNOTATION: &str = "mountPath";
/// Annotation holding the desired object an observed one was last written from.
pub const LAST_APPLIED_ANNOTATION: &str = "kora.io/last-applied";

pub type LabelSet = SmallVec<[(String, String); 4]>;

/// How a desired object is matched against what the API server holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// Deterministic key.
    Named { namespace: String, name: String },
    /// Label selector plus an optional `(annotation, value)` discriminator used
    /// when several objects legitimately share the label set.
    Labeled {
        namespace: String,
        labels: LabelSet,
        discriminator: Option<(String, String)>,
    },
}

impl Identity {
    pub fn namespace(&self) -> &str {
        match self {
            Identity::Named { namespace, .. } | Identity::Labeled { namespace, .. } => namespace,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Named { namespace, name } => write!(f, "{}/{}", namespace, name),
            Identity::Labeled { namespace, labels, discriminator } => {
                write!(f, "{}/{{", namespace)?;
                for (i, (k, v)) in labels.iter().enumerate() {
                    if i > 0 { f.write_str(",")?; }
                    write!(f, "{}={}", k, v)?;
                }
                f.write_str("}")?;
                if let Some((k, v)) = discriminator { write!(f, "[{}={}]", k, v)?; }
                Ok(())
            }
        }
    }
}

/// Pod to delete so that the next pass recreates it from the desired spec.
#[derive(Debug, Clone, PartialEq)]
pub struct RecreateTarget {
    pub namespace: String,
    pub name: String,
    pub broker_id: Option<String>,
    /// Placement the server observed for the old pod, written back before deletion.
    pub affinity: Option<NodeAffinity>,
}

/// Result of comparing one desired object with its observed counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Already equivalent.
    NoOp,
    /// Nothing observed.
    Create,
    /// Replace in place with the merged object (server-assigned fields carried over).
    Update(Box<KubeObject>),
    /// Immutable kind differs: delete, the next pass creates.
    Recreate(RecreateTarget),
    /// Observed differs but is authoritative; nothing is written.
    Retain,
}

/// Outcome of the post-create scale hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ScaleReport {
    Delivered,
    Failed(String),
}

/// What a single convergence pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Created { scale: Option<ScaleReport> },
    InSync,
    Updated,
    DeletedForRecreate,
    Retained,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Created { .. } => "created",
            PassOutcome::InSync => "in_sync",
            PassOutcome::Updated => "updated",
            PassOutcome::DeletedForRecreate => "deleted_for_recreate",
            PassOutcome::Retained => "retained",
        }
    }

    /// True when the pass issued a write against the API server.
    pub fn wrote(&self) -> bool {
        matches!(self, PassOutcome::Created { .. } | PassOutcome::Updated | PassOutcome::DeletedForRecreate)
    }
}

pub mod prelude {
    pub use super::{
        ClusterRef, Identity, KubeObject, Listener, MergeDecision, PassOutcome, RecreateTarget, ResourceKind,
        ScaleReport, BROKER_ID_LABEL, CLUSTER_LABEL, MOUNT_PATH_ANNOTATION,
    };
}
