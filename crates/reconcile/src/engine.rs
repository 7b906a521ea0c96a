//! Convergence engine: resolve → fetch → diff → merge-or-recreate → commit.

use std::sync::Arc;
use std::time::Instant;

use kora_core::{Identity, KubeObject, MergeDecision, PassOutcome, ResourceKind, BROKER_ID_LABEL};
use kora_kubehub::{ObjectPlane, PlaneError};
use metrics::{counter, histogram};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::equality::{drift_summary, record_last_applied, strip_noisy};
use crate::identity::IdentityResolver;
use crate::placement::{NoPlacement, PlacementRecorder};
use crate::policy::{self, MergePolicyRegistry};
use crate::scale::{self, NoScale, ScaleSignal};
use crate::ConvergeError;

/// Explicit configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name of the Kafka cluster resource; value of the `kafka_cr` label.
    pub cluster_name: String,
}

impl EngineConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self { cluster_name: cluster_name.into() }
    }
}

/// Drives Kubernetes objects of one cluster toward their desired state.
/// Holds no state between passes; every pass re-reads the API server.
pub struct Engine {
    plane: Arc<dyn ObjectPlane>,
    registry: MergePolicyRegistry,
    resolver: IdentityResolver,
    scale: Arc<dyn ScaleSignal>,
    placement: Arc<dyn PlacementRecorder>,
    span: Span,
}

impl Engine {
    /// Standard policies, no scale hook, no placement write-back.
    pub fn new(plane: Arc<dyn ObjectPlane>, config: EngineConfig) -> Self {
        let span = info_span!("engine", cluster = %config.cluster_name);
        Self {
            plane,
            registry: MergePolicyRegistry::standard(),
            resolver: IdentityResolver::new(config.cluster_name),
            scale: Arc::new(NoScale),
            placement: Arc::new(NoPlacement),
            span,
        }
    }

    pub fn with_registry(mut self, registry: MergePolicyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_scale_signal(mut self, scale: Arc<dyn ScaleSignal>) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementRecorder>) -> Self {
        self.placement = placement;
        self
    }

    /// Parent span for every pass run by this engine.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Key under which callers serialize passes for the same object.
    pub fn identity_key(&self, desired: &KubeObject) -> Result<String, ConvergeError> {
        Ok(format!("{}:{}", desired.kind(), self.resolver.identity_of(desired)?))
    }

    /// Run one convergence pass for a desired object.
    pub async fn converge(&self, desired: &KubeObject) -> Result<PassOutcome, ConvergeError> {
        let t0 = Instant::now();
        let kind = desired.kind();
        let span = info_span!(parent: &self.span, "converge", pass = %Uuid::new_v4(), kind = %kind);
        let res = self.pass(desired).instrument(span.clone()).await;
        histogram!("converge_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let _entered = span.enter();
        match &res {
            Ok(outcome) => {
                counter!("converge_passes_total", 1u64, "kind" => kind.as_str(), "outcome" => outcome.as_str());
            }
            Err(e) => {
                counter!("converge_errors_total", 1u64, "kind" => kind.as_str());
                if e.needs_operator() {
                    error!(error = %e, "convergence needs operator attention");
                } else {
                    warn!(error = %e, retryable = e.is_retryable(), "convergence pass failed");
                }
            }
        }
        res
    }

    async fn pass(&self, desired: &KubeObject) -> Result<PassOutcome, ConvergeError> {
        let kind = desired.kind();
        let merge = self.registry.policy(kind)?;
        let resolution = self.resolver.resolve(self.plane.as_ref(), desired).await?;
        let identity = &resolution.identity;

        match policy::plan(merge, desired, resolution.current.as_ref())? {
            MergeDecision::NoOp => {
                debug!(identity = %identity, mode = ?resolution.mode, "resource is in sync");
                Ok(PassOutcome::InSync)
            }
            MergeDecision::Create => self.create(desired, identity).await,
            MergeDecision::Update(next) => {
                if let Some(observed) = &resolution.current {
                    if let (Ok(d), Ok(o)) = (desired.to_json(), observed.to_json()) {
                        let drift = drift_summary(&strip_noisy(d), &strip_noisy(o));
                        debug!(adds = drift.adds, updates = drift.updates, removes = drift.removes, "drift");
                    }
                }
                let mut next = *next;
                record_last_applied(&mut next, desired)?;
                self.plane
                    .replace(&next)
                    .await
                    .map_err(|e| ConvergeError::remote("replace", kind, identity, e))?;
                info!(identity = %identity, policy = merge.as_str(), "resource updated");
                Ok(PassOutcome::Updated)
            }
            MergeDecision::Recreate(target) => {
                if let (Some(broker_id), Some(affinity)) = (&target.broker_id, &target.affinity) {
                    self.placement
                        .record(&target.namespace, broker_id, affinity)
                        .await
                        .map_err(|source| ConvergeError::Placement { broker_id: broker_id.clone(), source })?;
                }
                match self.plane.delete(kind, &target.namespace, &target.name).await {
                    Ok(()) | Err(PlaneError::NotFound) => {}
                    Err(e) => return Err(ConvergeError::remote("delete", kind, identity, e)),
                }
                info!(identity = %identity, name = %target.name, "immutable resource differs, deleted for recreation");
                Ok(PassOutcome::DeletedForRecreate)
            }
            MergeDecision::Retain => {
                counter!("converge_storage_drift_total", 1u64);
                warn!(identity = %identity, "observed object differs from desired spec; kept as created");
                Ok(PassOutcome::Retained)
            }
        }
    }

    async fn create(&self, desired: &KubeObject, identity: &Identity) -> Result<PassOutcome, ConvergeError> {
        let kind = desired.kind();
        let mut stamped = desired.clone();
        record_last_applied(&mut stamped, desired)?;
        let created = self
            .plane
            .create(&stamped)
            .await
            .map_err(|e| ConvergeError::remote("create", kind, identity, e))?;
        info!(identity = %identity, name = created.name().unwrap_or("-"), "resource created");
        let scale = match (kind, desired.label(BROKER_ID_LABEL)) {
            (ResourceKind::Pod, Some(broker_id)) => Some(scale::notify(self.scale.as_ref(), broker_id, identity.namespace()).await),
            _ => None,
        };
        Ok(PassOutcome::Created { scale })
    }
}
