use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kora_core::{ClusterRef, KubeObject, Listener, PassOutcome, ScaleReport};
use kora_kubehub::{KubePlane, PlaneConfig};
use kora_reconcile::{
    manifests, ClusterResourcePlacement, ConvergeError, CruiseControl, Engine, EngineConfig, IdentityLocks,
};
use kora_topics::{AdminConnection, AdminPlane, KubeSecrets, TopicConverger, TopicError, TopicOutcome, TopicSpec};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "koractl", version, about = "Kora CLI: converge a Kafka cluster's Kubernetes objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct ClusterArgs {
    /// Name of the KafkaCluster resource
    #[arg(long = "cluster", env = "KORA_CLUSTER")]
    cluster: Option<String>,
    /// uid of the KafkaCluster resource, for owner references on generated services
    #[arg(long = "cluster-uid")]
    uid: Option<String>,
    /// Brokers are addressed through the headless service
    #[arg(long = "headless", action = ArgAction::SetTrue)]
    headless: bool,
    /// Internal listener as name:port; repeatable, first one is used for admin connections
    #[arg(long = "listener", value_parser = parse_listener, default_value = "internal:29092")]
    listeners: Vec<Listener>,
    /// Secret holding clientCert/clientKey/caCert
    #[arg(long = "tls-secret")]
    tls_secret: Option<String>,
}

impl ClusterArgs {
    fn to_ref(&self, namespace: &str) -> Result<ClusterRef> {
        let name = self.cluster.clone().ok_or_else(|| anyhow!("--cluster (or KORA_CLUSTER) is required"))?;
        Ok(ClusterRef {
            name,
            namespace: namespace.to_string(),
            uid: self.uid.clone(),
            headless_service_enabled: self.headless,
            internal_listeners: self.listeners.clone(),
            tls_secret_name: self.tls_secret.clone(),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the objects declared in a manifest file
    Reconcile {
        /// Multi-document YAML with ConfigMaps, Services, Pods, PVCs, Deployments, StatefulSets
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Also converge the cluster's headless and Cruise Control services
        #[arg(long = "services", action = ArgAction::SetTrue)]
        services: bool,
        /// Repeat every N seconds until interrupted
        #[arg(long = "interval")]
        interval: Option<u64>,
        /// Ask Cruise Control to rebalance after a broker pod is created
        #[arg(long = "cruise-control", action = ArgAction::SetTrue)]
        cruise_control: bool,
        /// Cruise Control base URL (default: in-cluster service)
        #[arg(long = "cruise-control-url")]
        cruise_control_url: Option<String>,
        /// Pin recreated broker pods to their node in the KafkaCluster resource
        #[arg(long = "placement", action = ArgAction::SetTrue)]
        placement: bool,
    },
    /// Print the resolved Kafka admin connection (secrets redacted)
    Connection {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Read KAFKA_* variables instead of deriving from the cluster
        #[arg(long = "from-env", action = ArgAction::SetTrue)]
        from_env: bool,
    },
    /// Converge, inspect or delete topics through the cluster's admin API
    Topics {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Read KAFKA_* variables instead of deriving from the cluster
        #[arg(long = "from-env", action = ArgAction::SetTrue)]
        from_env: bool,
        #[command(subcommand)]
        action: TopicAction,
    },
}

#[derive(Subcommand, Debug)]
enum TopicAction {
    /// Create missing topics, grow partitions, replace differing config overrides
    Ensure {
        /// YAML list of topics: name, partitions, replication_factor, config
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Show partition metadata of a topic
    Observe { name: String },
    /// Delete a topic if it exists
    Remove { name: String },
}

fn init_tracing() {
    let env = std::env::var("KORA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KORA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KORA_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_listener(s: &str) -> Result<Listener, String> {
    let (name, port) = s.split_once(':').ok_or_else(|| format!("expected name:port, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("listener name missing in '{}'", s));
    }
    let container_port = port.parse::<i32>().map_err(|_| format!("invalid port '{}'", port))?;
    Ok(Listener { name: name.to_string(), container_port })
}

/// Decode every non-empty document; objects without a namespace land in `namespace`.
fn parse_manifests(text: &str, namespace: &str) -> Result<Vec<KubeObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_json::Value::deserialize(doc).with_context(|| format!("document {}: invalid YAML", i))?;
        if value.is_null() {
            continue;
        }
        let mut obj = KubeObject::from_manifest(value).with_context(|| format!("document {}", i))?;
        if obj.namespace().is_none() {
            obj.meta_mut().namespace = Some(namespace.to_string());
        }
        out.push(obj);
    }
    Ok(out)
}

#[derive(Debug, Serialize)]
struct PassLine {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<PassOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    retryable: bool,
}

impl PassLine {
    fn ok(key: String, outcome: PassOutcome) -> Self {
        Self { key, outcome: Some(outcome), error: None, retryable: false }
    }

    fn failed(key: String, e: &ConvergeError) -> Self {
        Self { key, outcome: None, error: Some(e.to_string()), retryable: e.is_retryable() }
    }
}

/// One pass per desired object; passes for the same identity never overlap.
async fn run_cycle(engine: &Engine, locks: &IdentityLocks, desired: &[KubeObject]) -> Vec<PassLine> {
    let passes = desired.iter().map(|d| async move {
        let key = match engine.identity_key(d) {
            Ok(k) => k,
            Err(e) => return PassLine::failed(d.kind().to_string(), &e),
        };
        let _guard = locks.lock(&key).await;
        match engine.converge(d).await {
            Ok(outcome) => PassLine::ok(key, outcome),
            Err(e) => PassLine::failed(key, &e),
        }
    });
    futures::future::join_all(passes).await
}

fn print_lines(output: Output, lines: &[PassLine]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(lines)?),
        Output::Human => {
            for l in lines {
                match (&l.outcome, &l.error) {
                    (Some(PassOutcome::Created { scale: Some(ScaleReport::Failed(reason)) }), _) => {
                        println!("{}\tcreated (scale signal failed: {})", l.key, reason)
                    }
                    (Some(o), _) => println!("{}\t{}", l.key, o.as_str()),
                    (None, Some(e)) => println!("{}\terror{}: {}", l.key, if l.retryable { " (retryable)" } else { "" }, e),
                    (None, None) => println!("{}\t-", l.key),
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn reconcile(
    namespace: Option<String>,
    output: Output,
    file: PathBuf,
    cluster: ClusterArgs,
    services: bool,
    interval: Option<u64>,
    cruise_control: bool,
    cruise_control_url: Option<String>,
    placement: bool,
) -> Result<()> {
    let plane_cfg = PlaneConfig::from_env();
    let timeout = plane_cfg.operation_timeout;
    let plane = KubePlane::try_default(plane_cfg).await.context("building kube client")?;
    let client = plane.client();
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let cluster = cluster.to_ref(&ns)?;
    let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let mut desired = parse_manifests(&text, &ns)?;
    if services {
        if cluster.headless_service_enabled {
            desired.push(manifests::headless_service(&cluster));
        }
        desired.push(manifests::cruise_control_service(&cluster));
    }
    info!(cluster = %cluster.name, ns = %ns, objects = desired.len(), "reconcile invoked");

    let mut engine = Engine::new(Arc::new(plane), EngineConfig::new(&cluster.name));
    if cruise_control {
        let mut cc = CruiseControl::new(&cluster.name, timeout)?;
        if let Some(url) = cruise_control_url {
            cc = cc.with_base_url(url);
        }
        engine = engine.with_scale_signal(Arc::new(cc));
    }
    if placement {
        engine = engine.with_placement(Arc::new(ClusterResourcePlacement::new(client, &cluster.name).with_timeout(timeout)));
    }

    let locks = IdentityLocks::new();
    loop {
        let t0 = Instant::now();
        let lines = run_cycle(&engine, &locks, &desired).await;
        histogram!("koractl_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("koractl_cycles_total", 1u64);
        print_lines(output, &lines)?;
        let failed = lines.iter().filter(|l| l.error.is_some()).count();
        let Some(secs) = interval else {
            if failed > 0 {
                bail!("{} of {} passes failed", failed, lines.len());
            }
            return Ok(());
        };
        if failed > 0 {
            warn!(failed, total = lines.len(), "cycle finished with errors");
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}

async fn admin_connection(namespace: Option<String>, cluster: ClusterArgs, from_env: bool) -> Result<AdminConnection> {
    if from_env {
        return Ok(AdminConnection::from_env());
    }
    let client = kube::Client::try_default().await.context("building kube client")?;
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let cluster = cluster.to_ref(&ns)?;
    Ok(AdminConnection::for_cluster(&KubeSecrets::new(client), &cluster).await?)
}

async fn connection(namespace: Option<String>, output: Output, cluster: ClusterArgs, from_env: bool) -> Result<()> {
    let conn = admin_connection(namespace, cluster, from_env).await?;
    let summary = conn.summary();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        Output::Human => {
            println!("broker:   {}", summary.broker_uri);
            println!("tls:      {}{}", summary.use_tls, if summary.tls_material { " (client material loaded)" } else { "" });
            if let Some(issuer) = &summary.issuer_ca {
                println!("issuer:   {} ({})", issuer, summary.issuer_ca_kind.as_deref().unwrap_or("-"));
            }
            println!("timeout:  {}s", summary.operation_timeout_secs);
        }
    }
    Ok(())
}

#[cfg(feature = "kafka")]
fn kafka_admin(conn: &AdminConnection) -> Result<Arc<dyn AdminPlane>> {
    Ok(Arc::new(kora_topics::KafkaAdmin::connect(conn)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka_admin(_conn: &AdminConnection) -> Result<Arc<dyn AdminPlane>> {
    bail!("koractl was built without the kafka feature")
}

#[derive(Debug, Serialize)]
struct TopicLine {
    topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<TopicOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    retryable: bool,
}

impl TopicLine {
    fn from_result(topic: &str, res: Result<TopicOutcome, TopicError>) -> Self {
        match res {
            Ok(outcome) => Self { topic: topic.to_string(), outcome: Some(outcome), error: None, retryable: false },
            Err(e) => Self { topic: topic.to_string(), outcome: None, error: Some(e.to_string()), retryable: e.is_retryable() },
        }
    }
}

async fn ensure_topics(converger: &TopicConverger, specs: &[TopicSpec]) -> Vec<TopicLine> {
    let mut lines = Vec::with_capacity(specs.len());
    for spec in specs {
        lines.push(TopicLine::from_result(&spec.name, converger.ensure(spec).await));
    }
    lines
}

fn print_topic_lines(output: Output, lines: &[TopicLine]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(lines)?),
        Output::Human => {
            for l in lines {
                match (&l.outcome, &l.error) {
                    (Some(TopicOutcome::Created), _) => println!("{}\tcreated", l.topic),
                    (Some(TopicOutcome::Converged { partitions_added_to, config_altered, shrink_refused }), _) => {
                        let mut notes = Vec::new();
                        if let Some(to) = partitions_added_to {
                            notes.push(format!("partitions -> {}", to));
                        }
                        if *config_altered {
                            notes.push("config replaced".to_string());
                        }
                        if *shrink_refused {
                            notes.push("shrink refused".to_string());
                        }
                        println!("{}\t{}", l.topic, if notes.is_empty() { "in_sync".to_string() } else { notes.join(", ") });
                    }
                    (None, Some(e)) => println!("{}\terror{}: {}", l.topic, if l.retryable { " (retryable)" } else { "" }, e),
                    (None, None) => println!("{}\t-", l.topic),
                }
            }
        }
    }
    Ok(())
}

async fn topics(namespace: Option<String>, output: Output, cluster: ClusterArgs, from_env: bool, action: TopicAction) -> Result<()> {
    let conn = admin_connection(namespace, cluster, from_env).await?;
    let converger = TopicConverger::new(kafka_admin(&conn)?).with_timeout(conn.operation_timeout);
    info!(broker = %conn.broker_uri, tls = conn.use_tls, "topics invoked");
    match action {
        TopicAction::Ensure { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let specs: Vec<TopicSpec> = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            let lines = ensure_topics(&converger, &specs).await;
            print_topic_lines(output, &lines)?;
            let failed = lines.iter().filter(|l| l.error.is_some()).count();
            if failed > 0 {
                bail!("{} of {} topics failed", failed, lines.len());
            }
        }
        TopicAction::Observe { name } => {
            let meta = converger.observe(&name).await?;
            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&meta)?),
                Output::Human => {
                    println!("topic:       {}", meta.name);
                    for p in &meta.partitions {
                        println!("partition {}\tleader {}\treplicas {:?}\tisr {:?}", p.id, p.leader, p.replicas, p.isr);
                    }
                }
            }
        }
        TopicAction::Remove { name } => {
            let deleted = converger.remove(&name).await?;
            println!("{}\t{}", name, if deleted { "deleted" } else { "absent" });
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Reconcile { file, cluster, services, interval, cruise_control, cruise_control_url, placement } => {
            reconcile(cli.namespace, cli.output, file, cluster, services, interval, cruise_control, cruise_control_url, placement).await
        }
        Commands::Connection { cluster, from_env } => connection(cli.namespace, cli.output, cluster, from_env).await,
        Commands::Topics { cluster, from_env, action } => topics(cli.namespace, cli.output, cluster, from_env, action).await,
    };
    if let Err(e) = &res {
        error!(error = %format!("{:#}", e), "command failed");
    }
    res
}
