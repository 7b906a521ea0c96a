use std::fmt::Display;
use std::time::Duration;

use kora_core::ResourceKind;
use kora_kubehub::PlaneError;

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("{kind} {identity}: {count} objects match, refusing to pick one")]
    Ambiguous { kind: ResourceKind, identity: String, count: usize },

    #[error("no merge policy registered for {kind}")]
    UnsupportedKind { kind: ResourceKind },

    #[error("desired {kind} has no {field}")]
    MissingIdentity { kind: ResourceKind, field: &'static str },

    #[error("create {kind} {identity}: an object of that name already exists, retry next pass")]
    AlreadyExists { kind: ResourceKind, identity: String },

    #[error("{op} {kind} {identity}: stale resourceVersion, retry next pass")]
    ConflictingVersion { op: &'static str, kind: ResourceKind, identity: String },

    #[error("{op} {kind} {identity}: timed out after {after:?}")]
    Timeout { op: &'static str, kind: ResourceKind, identity: String, after: Duration },

    #[error("{op} {kind} {identity} failed: {source}")]
    Remote { op: &'static str, kind: ResourceKind, identity: String, source: PlaneError },

    #[error("recording placement of broker {broker_id} failed: {source}")]
    Placement { broker_id: String, source: PlaneError },

    #[error("encoding {kind} for comparison: {source}")]
    Codec { kind: ResourceKind, source: serde_json::Error },
}

impl ConvergeError {
    /// Wrap a plane failure with the operation, kind and identity it concerned.
    pub fn remote(op: &'static str, kind: ResourceKind, identity: impl Display, err: PlaneError) -> Self {
        let identity = identity.to_string();
        match err {
            PlaneError::Conflict(_) if op == "create" => ConvergeError::AlreadyExists { kind, identity },
            PlaneError::Conflict(_) => ConvergeError::ConflictingVersion { op, kind, identity },
            PlaneError::Timeout(after) => ConvergeError::Timeout { op, kind, identity, after },
            source => ConvergeError::Remote { op, kind, identity, source },
        }
    }

    /// Re-running the pass later is expected to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConvergeError::AlreadyExists { .. } | ConvergeError::ConflictingVersion { .. } | ConvergeError::Timeout { .. } => true,
            ConvergeError::Remote { source, .. } | ConvergeError::Placement { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Needs a human: the pass will keep failing the same way.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            ConvergeError::Ambiguous { .. } | ConvergeError::UnsupportedKind { .. } | ConvergeError::MissingIdentity { .. }
        )
    }
}
