//! Structural comparison of desired vs observed objects.
//!
//! Desired objects never carry server bookkeeping, and the server fills in
//! defaults the caller never declared, including whole list elements such as
//! the service-account token volume of a pod. So equality here means
//! containment: every field the caller set must be present and equal in the
//! observed object once bookkeeping is stripped from both sides.
//!
//! Containment alone cannot see a list element the caller stopped declaring.
//! Every write therefore records the desired object it came from under
//! [`LAST_APPLIED_ANNOTATION`]; a recorded object that differs from the
//! current desired one is drift.

use kora_core::{KubeObject, LAST_APPLIED_ANNOTATION};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ConvergeError;

/// Server-populated metadata ignored by comparison.
const NOISY_META: [&str; 6] = ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "selfLink"];

pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in NOISY_META {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn merge_key(v: &Json) -> Option<&str> {
    v.get("name").and_then(Json::as_str)
}

/// True when every field set in `desired` appears with the same value in `observed`.
///
/// Lists of named objects (containers, volumes, volumeMounts, ports) match
/// element by name. Other lists of objects match in order but may carry
/// extra observed elements in between. Lists of scalars must be equal.
pub fn contains(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => contains(dv, ov),
            None => dv.is_null(),
        }),
        (Json::Array(d), Json::Array(o)) if !d.is_empty() && d.iter().all(|e| merge_key(e).is_some()) => d.iter().all(|dv| {
            let key = merge_key(dv);
            o.iter().any(|ov| merge_key(ov) == key && contains(dv, ov))
        }),
        (Json::Array(d), Json::Array(o)) if !d.is_empty() && d.iter().all(Json::is_object) => {
            let mut rest = o.iter();
            d.iter().all(|dv| rest.any(|ov| contains(dv, ov)))
        }
        (Json::Array(d), Json::Array(o)) => d.len() == o.len() && d.iter().zip(o.iter()).all(|(dv, ov)| contains(dv, ov)),
        (d, o) => d == o,
    }
}

/// The desired object as recorded on the server: bookkeeping and any
/// previous record stripped.
pub fn applied_view(desired: &KubeObject) -> Result<Json, ConvergeError> {
    let mut v = strip_noisy(desired.to_json().map_err(|source| ConvergeError::Codec { kind: desired.kind(), source })?);
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        let drop_all = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            }
            None => false,
        };
        if drop_all {
            meta.remove("annotations");
        }
    }
    Ok(v)
}

/// Stamp `target`, about to be written, with the desired object it was built from.
pub fn record_last_applied(target: &mut KubeObject, desired: &KubeObject) -> Result<(), ConvergeError> {
    let view = applied_view(desired)?;
    let recorded = serde_json::to_string(&view).map_err(|source| ConvergeError::Codec { kind: desired.kind(), source })?;
    target
        .meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), recorded);
    Ok(())
}

/// Equivalence check run before any merge.
///
/// An observed object without a readable record is compared by containment only.
pub fn equivalent(desired: &KubeObject, observed: &KubeObject) -> Result<bool, ConvergeError> {
    let d = applied_view(desired)?;
    let recorded = observed.annotation(LAST_APPLIED_ANNOTATION).and_then(|r| serde_json::from_str::<Json>(r).ok());
    if recorded.is_some_and(|r| r != d) {
        return Ok(false);
    }
    let o = strip_noisy(observed.to_json().map_err(|source| ConvergeError::Codec { kind: desired.kind(), source })?);
    Ok(contains(&d, &o))
}

/// Rough size of a drift, for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Count fields the desired object adds, changes or drops relative to observed,
/// ignoring server-only fields (present only in observed objects).
pub fn drift_summary(desired: &Json, observed: &Json) -> DriftSummary {
    fn walk(a: &Json, b: &Json, s: &mut DriftSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for (av, bv) in aa.iter().zip(bb.iter()) {
                    if av != bv { walk(av, bv, s); }
                }
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DriftSummary::default();
    walk(desired, observed, &mut s);
    s
}
