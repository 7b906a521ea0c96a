//! Merge policies keyed by resource kind.

use std::collections::BTreeMap;

use kora_core::{KubeObject, MergeDecision, RecreateTarget, ResourceKind, BROKER_ID_LABEL};

use crate::{equality, placement, ConvergeError};

/// How an observed object that differs from the desired one is brought in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Carry the observed `resourceVersion`, replace the rest.
    ReplaceCarryVersion,
    /// As above, also keeping the server-assigned cluster IP(s) of a service.
    ReplaceCarryVersionAndAddress,
    /// Never patched: delete so the next pass recreates. Observed placement is kept aside first.
    RecreateImmutable,
    /// Observed object stays as created; storage attributes are not safely mutable.
    ObservedAuthoritative,
}

impl MergePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergePolicy::ReplaceCarryVersion => "replace_carry_version",
            MergePolicy::ReplaceCarryVersionAndAddress => "replace_carry_version_and_address",
            MergePolicy::RecreateImmutable => "recreate_immutable",
            MergePolicy::ObservedAuthoritative => "observed_authoritative",
        }
    }

    /// Decide what to do with two objects already known to differ.
    pub fn merge(self, desired: &KubeObject, observed: &KubeObject) -> Result<MergeDecision, ConvergeError> {
        match self {
            MergePolicy::ReplaceCarryVersion => Ok(MergeDecision::Update(Box::new(carry_version(desired, observed)))),
            MergePolicy::ReplaceCarryVersionAndAddress => {
                let mut next = carry_version(desired, observed);
                if let (KubeObject::Service(n), KubeObject::Service(o)) = (&mut next, observed) {
                    if let (Some(ns), Some(os)) = (n.spec.as_mut(), o.spec.as_ref()) {
                        ns.cluster_ip = os.cluster_ip.clone();
                        ns.cluster_ips = os.cluster_ips.clone();
                    }
                }
                Ok(MergeDecision::Update(Box::new(next)))
            }
            MergePolicy::RecreateImmutable => {
                let kind = observed.kind();
                let namespace = observed
                    .namespace()
                    .ok_or(ConvergeError::MissingIdentity { kind, field: "observed metadata.namespace" })?;
                let name = observed.name().ok_or(ConvergeError::MissingIdentity { kind, field: "observed metadata.name" })?;
                let affinity = match observed {
                    KubeObject::Pod(p) => placement::observed_affinity(p),
                    _ => None,
                };
                Ok(MergeDecision::Recreate(RecreateTarget {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    broker_id: observed.label(BROKER_ID_LABEL).map(str::to_string),
                    affinity,
                }))
            }
            MergePolicy::ObservedAuthoritative => Ok(MergeDecision::Retain),
        }
    }
}

fn carry_version(desired: &KubeObject, observed: &KubeObject) -> KubeObject {
    let mut next = desired.clone();
    next.meta_mut().resource_version = observed.meta().resource_version.clone();
    next
}

/// Lookup table from kind to policy. Built once, passed into the engine.
#[derive(Debug, Clone, Default)]
pub struct MergePolicyRegistry {
    policies: BTreeMap<ResourceKind, MergePolicy>,
}

impl MergePolicyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Policies for every managed kind.
    pub fn standard() -> Self {
        Self::empty()
            .register(ResourceKind::ConfigMap, MergePolicy::ReplaceCarryVersion)
            .register(ResourceKind::Service, MergePolicy::ReplaceCarryVersionAndAddress)
            .register(ResourceKind::Pod, MergePolicy::RecreateImmutable)
            .register(ResourceKind::PersistentVolumeClaim, MergePolicy::ObservedAuthoritative)
            .register(ResourceKind::Deployment, MergePolicy::ReplaceCarryVersion)
            .register(ResourceKind::StatefulSet, MergePolicy::ReplaceCarryVersion)
    }

    pub fn register(mut self, kind: ResourceKind, policy: MergePolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: ResourceKind) -> Result<MergePolicy, ConvergeError> {
        self.policies.get(&kind).copied().ok_or(ConvergeError::UnsupportedKind { kind })
    }
}

/// Full decision for one desired object given what (if anything) is observed.
pub fn plan(policy: MergePolicy, desired: &KubeObject, observed: Option<&KubeObject>) -> Result<MergeDecision, ConvergeError> {
    let Some(observed) = observed else { return Ok(MergeDecision::Create) };
    if equality::equivalent(desired, observed)? {
        return Ok(MergeDecision::NoOp);
    }
    policy.merge(desired, observed)
}
