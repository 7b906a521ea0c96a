#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::NodeAffinity;
use kora_core::{KubeObject, PassOutcome, ResourceKind, ScaleReport, LAST_APPLIED_ANNOTATION};
use kora_kubehub::{MemPlane, ObjectPlane, PlaneError, WriteCall};
use kora_reconcile::{
    ConvergeError, Engine, EngineConfig, MergePolicy, MergePolicyRegistry, PlacementRecorder, ScaleSignal,
};

fn obj(v: serde_json::Value) -> KubeObject {
    KubeObject::from_manifest(v).unwrap()
}

fn broker_pod(name: Option<&str>, broker: &str, image: &str, node: Option<&str>) -> KubeObject {
    let mut meta = serde_json::json!({
        "namespace": "kafka",
        "generateName": format!("x-{}-", broker),
        "labels": { "app": "kafka", "kafka_cr": "x", "brokerId": broker }
    });
    if let Some(n) = name {
        meta["name"] = n.into();
    }
    let mut spec = serde_json::json!({
        "containers": [{
            "name": "kafka",
            "image": image,
            "volumeMounts": [{ "name": "kafka-data", "mountPath": "/kafka-logs" }]
        }],
        "volumes": [{ "name": "kafka-data", "persistentVolumeClaim": { "claimName": format!("x-{}-storage", broker) } }],
        "tolerations": [{ "key": "dedicated", "operator": "Equal", "value": "kafka", "effect": "NoSchedule" }]
    });
    if let Some(n) = node {
        spec["nodeName"] = n.into();
    }
    obj(serde_json::json!({ "apiVersion": "v1", "kind": "Pod", "metadata": meta, "spec": spec }))
}

fn broker_pvc(name: Option<&str>, broker: &str, mount: &str, size: &str) -> KubeObject {
    let mut meta = serde_json::json!({
        "namespace": "kafka",
        "generateName": format!("x-{}-storage-", broker),
        "labels": { "app": "kafka", "kafka_cr": "x", "brokerId": broker },
        "annotations": { "mountPath": mount }
    });
    if let Some(n) = name {
        meta["name"] = n.into();
    }
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": meta,
        "spec": { "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": size } } }
    }))
}

fn config_map(value: &str) -> KubeObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "x-config-2", "namespace": "kafka", "labels": { "kafka_cr": "x" } },
        "data": { "broker-config": value }
    }))
}

fn service(port: i32) -> KubeObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "x-all-broker", "namespace": "kafka" },
        "spec": { "selector": { "kafka_cr": "x" }, "ports": [{ "name": "tcp-internal", "port": port }] }
    }))
}

#[derive(Default)]
struct RecordingScale {
    calls: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait::async_trait]
impl ScaleSignal for RecordingScale {
    async fn broker_added(&self, broker_id: &str, namespace: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((broker_id.to_string(), namespace.to_string()));
        if self.fail {
            anyhow::bail!("cruise control is still starting");
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPlacement {
    calls: Mutex<Vec<(String, NodeAffinity)>>,
}

#[async_trait::async_trait]
impl PlacementRecorder for RecordingPlacement {
    async fn record(&self, _namespace: &str, broker_id: &str, affinity: &NodeAffinity) -> Result<(), PlaneError> {
        self.calls.lock().unwrap().push((broker_id.to_string(), affinity.clone()));
        Ok(())
    }
}

/// Bumps the stored resourceVersion right before every replace, like a
/// concurrent writer landing between the read and the write.
struct Racing(Arc<MemPlane>);

#[async_trait::async_trait]
impl ObjectPlane for Racing {
    async fn get(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<Option<KubeObject>, PlaneError> {
        self.0.get(kind, ns, name).await
    }
    async fn list(&self, kind: ResourceKind, ns: &str, labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError> {
        self.0.list(kind, ns, labels).await
    }
    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        self.0.create(obj).await
    }
    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        self.0.touch(obj.kind(), obj.namespace().unwrap_or_default(), obj.name().unwrap_or_default());
        self.0.replace(obj).await
    }
    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<(), PlaneError> {
        self.0.delete(kind, ns, name).await
    }
}

/// Reads come back empty while the object already exists, like another
/// writer creating it between our read and our create.
struct LateReader(Arc<MemPlane>);

#[async_trait::async_trait]
impl ObjectPlane for LateReader {
    async fn get(&self, _kind: ResourceKind, _ns: &str, _name: &str) -> Result<Option<KubeObject>, PlaneError> {
        Ok(None)
    }
    async fn list(&self, _kind: ResourceKind, _ns: &str, _labels: &[(String, String)]) -> Result<Vec<KubeObject>, PlaneError> {
        Ok(Vec::new())
    }
    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        self.0.create(obj).await
    }
    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, PlaneError> {
        self.0.replace(obj).await
    }
    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<(), PlaneError> {
        self.0.delete(kind, ns, name).await
    }
}

fn engine(plane: Arc<MemPlane>) -> Engine {
    Engine::new(plane, EngineConfig::new("x"))
}

#[tokio::test]
async fn missing_broker_pod_is_created_then_scaled() {
    let plane = Arc::new(MemPlane::new());
    let scale = Arc::new(RecordingScale::default());
    let engine = engine(plane.clone()).with_scale_signal(scale.clone());

    let outcome = engine.converge(&broker_pod(None, "2", "kafka:3.6", None)).await.unwrap();
    assert_eq!(outcome, PassOutcome::Created { scale: Some(ScaleReport::Delivered) });

    let writes = plane.writes();
    assert_eq!(writes.len(), 1);
    assert!(matches!(&writes[0], WriteCall::Create { kind: ResourceKind::Pod, .. }));
    assert_eq!(*scale.calls.lock().unwrap(), vec![("2".to_string(), "kafka".to_string())]);
}

#[tokio::test]
async fn unmatched_mount_path_creates_a_third_claim() {
    let plane = Arc::new(MemPlane::with_objects([
        broker_pvc(Some("x-2-storage-a"), "2", "/kafka-logs-a", "10Gi"),
        broker_pvc(Some("x-2-storage-b"), "2", "/kafka-logs-b", "10Gi"),
    ]));
    let engine = engine(plane.clone());

    let outcome = engine.converge(&broker_pvc(None, "2", "/kafka-logs-c", "10Gi")).await.unwrap();
    assert_eq!(outcome, PassOutcome::Created { scale: None });

    let writes = plane.writes();
    assert_eq!(writes.len(), 1);
    assert!(matches!(&writes[0], WriteCall::Create { kind: ResourceKind::PersistentVolumeClaim, .. }));
    let names: Vec<String> = plane
        .objects(ResourceKind::PersistentVolumeClaim)
        .iter()
        .filter_map(|o| o.name().map(str::to_string))
        .collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&"x-2-storage-a".to_string()));
    assert!(names.contains(&"x-2-storage-b".to_string()));
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let plane = Arc::new(MemPlane::new());
    let engine = engine(plane.clone());

    let desired = [
        config_map("broker.id=2"),
        service(29092),
        broker_pod(None, "2", "kafka:3.6", None),
        broker_pvc(None, "2", "/kafka-logs", "10Gi"),
    ];
    for d in &desired {
        assert!(engine.converge(d).await.unwrap().wrote());
    }
    plane.clear_writes();
    for d in &desired {
        assert_eq!(engine.converge(d).await.unwrap(), PassOutcome::InSync);
    }
    assert!(plane.writes().is_empty());
}

#[tokio::test]
async fn pod_with_server_injected_volume_is_in_sync() {
    // Seeded without a last-applied record; the plane adds the token volume,
    // its mount and the default tolerations like an API server does.
    let plane = Arc::new(MemPlane::with_objects([broker_pod(Some("x-2-abcde"), "2", "kafka:3.6", Some("node-a"))]));
    let Some(KubeObject::Pod(seeded)) = plane.objects(ResourceKind::Pod).pop() else { panic!("pod not seeded") };
    let volumes = seeded.spec.and_then(|s| s.volumes).unwrap_or_default();
    assert!(volumes.iter().any(|v| v.name.starts_with("kube-api-access-")));

    let scale = Arc::new(RecordingScale::default());
    let engine = engine(plane.clone()).with_scale_signal(scale.clone());
    assert_eq!(engine.converge(&broker_pod(None, "2", "kafka:3.6", None)).await.unwrap(), PassOutcome::InSync);
    assert!(plane.writes().is_empty());
    assert!(scale.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn created_objects_carry_the_desired_record() {
    let plane = Arc::new(MemPlane::new());
    let engine = engine(plane.clone());
    engine.converge(&service(29092)).await.unwrap();

    let stored = plane.objects(ResourceKind::Service).pop().unwrap();
    let recorded: serde_json::Value = serde_json::from_str(stored.annotation(LAST_APPLIED_ANNOTATION).unwrap()).unwrap();
    assert_eq!(recorded["spec"]["ports"][0]["port"], 29092);
    assert!(recorded["spec"].get("clusterIP").is_none());

    // Dropping a port is seen through the record even though the rest is contained.
    let narrowed = obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "x-all-broker", "namespace": "kafka" },
        "spec": { "selector": { "kafka_cr": "x" } }
    }));
    assert_eq!(engine.converge(&narrowed).await.unwrap(), PassOutcome::Updated);
}

#[tokio::test]
async fn config_drift_is_replaced_with_observed_version() {
    let plane = Arc::new(MemPlane::with_objects([config_map("broker.id=1")]));
    let engine = engine(plane.clone());

    assert_eq!(engine.converge(&config_map("broker.id=2")).await.unwrap(), PassOutcome::Updated);
    assert_eq!(plane.writes().len(), 1);
    let stored = plane.objects(ResourceKind::ConfigMap).pop().unwrap();
    let KubeObject::ConfigMap(cm) = stored else { panic!("not a config map") };
    assert_eq!(cm.data.unwrap().get("broker-config").map(String::as_str), Some("broker.id=2"));
}

#[tokio::test]
async fn service_update_keeps_cluster_ip() {
    let plane = Arc::new(MemPlane::new());
    let engine = engine(plane.clone());
    engine.converge(&service(29092)).await.unwrap();
    let ip_before = match plane.objects(ResourceKind::Service).pop() {
        Some(KubeObject::Service(s)) => s.spec.and_then(|s| s.cluster_ip),
        _ => None,
    };
    assert!(ip_before.is_some());

    assert_eq!(engine.converge(&service(29093)).await.unwrap(), PassOutcome::Updated);
    let Some(KubeObject::Service(after)) = plane.objects(ResourceKind::Service).pop() else { panic!("service gone") };
    let spec = after.spec.unwrap();
    assert_eq!(spec.cluster_ip, ip_before);
    assert_eq!(spec.ports.unwrap()[0].port, 29093);
}

#[tokio::test]
async fn differing_pod_is_deleted_not_patched() {
    let plane = Arc::new(MemPlane::with_objects([broker_pod(Some("x-2-abcde"), "2", "kafka:3.5", Some("node-a"))]));
    let placement = Arc::new(RecordingPlacement::default());
    let scale = Arc::new(RecordingScale::default());
    let engine = engine(plane.clone()).with_placement(placement.clone()).with_scale_signal(scale.clone());
    let desired = broker_pod(None, "2", "kafka:3.6", None);

    assert_eq!(engine.converge(&desired).await.unwrap(), PassOutcome::DeletedForRecreate);
    assert_eq!(
        plane.writes(),
        vec![WriteCall::Delete { kind: ResourceKind::Pod, namespace: "kafka".into(), name: "x-2-abcde".into() }]
    );
    let recorded = placement.calls.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "2");

    // The next pass finds nothing and creates the replacement.
    assert!(matches!(engine.converge(&desired).await.unwrap(), PassOutcome::Created { .. }));
    assert_eq!(scale.calls.lock().unwrap().len(), 1);
    let writes = plane.writes();
    assert!(writes.iter().all(|w| w.kind() == ResourceKind::Pod));
    assert!(!writes.iter().any(|w| matches!(w, WriteCall::Replace { .. })));
}

#[tokio::test]
async fn duplicate_broker_pods_are_refused_without_writes() {
    let plane = Arc::new(MemPlane::with_objects([
        broker_pod(Some("x-2-aaaaa"), "2", "kafka:3.6", None),
        broker_pod(Some("x-2-bbbbb"), "2", "kafka:3.6", None),
    ]));
    let engine = engine(plane.clone());

    let err = engine.converge(&broker_pod(None, "2", "kafka:3.6", None)).await.unwrap_err();
    assert!(matches!(err, ConvergeError::Ambiguous { kind: ResourceKind::Pod, count: 2, .. }));
    assert!(err.needs_operator());
    assert!(plane.writes().is_empty());
}

#[tokio::test]
async fn unregistered_kind_fails_before_any_call() {
    let plane = Arc::new(MemPlane::new());
    plane.set_unavailable(true);
    let registry = MergePolicyRegistry::empty().register(ResourceKind::ConfigMap, MergePolicy::ReplaceCarryVersion);
    let engine = engine(plane.clone()).with_registry(registry);

    let err = engine.converge(&service(29092)).await.unwrap_err();
    assert!(matches!(err, ConvergeError::UnsupportedKind { kind: ResourceKind::Service }));
}

#[tokio::test]
async fn stale_resource_version_is_retryable() {
    let mem = Arc::new(MemPlane::with_objects([config_map("broker.id=1")]));
    let engine = Engine::new(Arc::new(Racing(mem.clone())), EngineConfig::new("x"));

    let err = engine.converge(&config_map("broker.id=2")).await.unwrap_err();
    assert!(matches!(err, ConvergeError::ConflictingVersion { op: "replace", .. }));
    assert!(err.is_retryable());
    assert!(mem.writes().is_empty());
}

#[tokio::test]
async fn lost_create_race_reports_already_exists() {
    let mem = Arc::new(MemPlane::with_objects([config_map("broker.id=1")]));
    let engine = Engine::new(Arc::new(LateReader(mem.clone())), EngineConfig::new("x"));

    let err = engine.converge(&config_map("broker.id=2")).await.unwrap_err();
    assert!(matches!(err, ConvergeError::AlreadyExists { kind: ResourceKind::ConfigMap, .. }));
    assert!(err.is_retryable());
    assert!(!err.to_string().contains("resourceVersion"));
    assert!(mem.writes().is_empty());
}

#[tokio::test]
async fn failed_scale_signal_keeps_the_create() {
    let plane = Arc::new(MemPlane::new());
    let scale = Arc::new(RecordingScale { fail: true, ..Default::default() });
    let engine = engine(plane.clone()).with_scale_signal(scale);

    match engine.converge(&broker_pod(None, "3", "kafka:3.6", None)).await.unwrap() {
        PassOutcome::Created { scale: Some(ScaleReport::Failed(reason)) } => assert!(reason.contains("still starting")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(plane.objects(ResourceKind::Pod).len(), 1);
}

#[tokio::test]
async fn storage_drift_is_left_alone() {
    let plane = Arc::new(MemPlane::with_objects([broker_pvc(Some("x-2-storage-a"), "2", "/kafka-logs", "10Gi")]));
    let engine = engine(plane.clone());

    let outcome = engine.converge(&broker_pvc(None, "2", "/kafka-logs", "20Gi")).await.unwrap();
    assert_eq!(outcome, PassOutcome::Retained);
    assert!(plane.writes().is_empty());
}

#[tokio::test]
async fn unreachable_api_is_a_retryable_remote_error() {
    let plane = Arc::new(MemPlane::new());
    plane.set_unavailable(true);
    let engine = engine(plane.clone());

    let err = engine.converge(&config_map("broker.id=2")).await.unwrap_err();
    assert!(matches!(err, ConvergeError::Remote { op: "get", .. }));
    assert!(err.is_retryable());
}
