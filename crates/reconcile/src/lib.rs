//! Kora reconcile: converges Kubernetes objects of a Kafka cluster toward their desired state.
//!
//! A pass resolves the observed counterpart of one desired object, compares
//! them structurally and then creates, replaces, deletes-for-recreate or leaves
//! it alone according to the [`MergePolicy`] registered for its kind.

#![forbid(unsafe_code)]

mod engine;
mod error;
pub mod equality;
mod guard;
pub mod identity;
pub mod manifests;
pub mod placement;
pub mod policy;
pub mod scale;

pub use engine::{Engine, EngineConfig};
pub use error::ConvergeError;
pub use guard::IdentityLocks;
pub use identity::{IdentityResolver, Resolution, ResolutionMode};
pub use placement::{ClusterResourcePlacement, NoPlacement, PlacementRecorder};
pub use policy::{MergePolicy, MergePolicyRegistry};
pub use scale::{CruiseControl, NoScale, ScaleSignal};
