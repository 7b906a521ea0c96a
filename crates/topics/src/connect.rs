//! How to reach a cluster's admin API: broker address, TLS material, timeouts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kora_core::ClusterRef;
use kube::{Api, Client};
use serde::Serialize;
use tracing::{info, warn};

use crate::converge::DEFAULT_ADMIN_TIMEOUT;

pub const ENV_BROKER: &str = "KAFKA_BROKER";
pub const ENV_USE_SSL: &str = "KAFKA_USE_SSL";
pub const ENV_SSL_KEY_FILE: &str = "KAFKA_SSL_KEY_FILE";
pub const ENV_SSL_CERT_FILE: &str = "KAFKA_SSL_CERT_FILE";
pub const ENV_SSL_CA_FILE: &str = "KAFKA_SSL_CA_FILE";
pub const ENV_INSECURE_SKIP_VERIFY: &str = "KAFKA_INSECURE_SKIP_VERIFY";
pub const ENV_OPERATION_TIMEOUT: &str = "KAFKA_OPERATION_TIMEOUT_SECONDS";
pub const ENV_ISSUER_CA_NAME: &str = "KAFKA_ISSUER_CA_NAME";
pub const ENV_ISSUER_CA_KIND: &str = "KAFKA_ISSUER_CA_KIND";

const CLIENT_CERT_KEY: &str = "clientCert";
const CLIENT_KEY_KEY: &str = "clientKey";
const CA_CERT_KEY: &str = "caCert";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("cluster {cluster} declares no internal listener")]
    NoInternalListener { cluster: String },
    #[error("reading secret {namespace}/{name}: {reason}")]
    SecretUnavailable { namespace: String, name: String, reason: String },
    #[error("secret {secret} has no {key}")]
    MissingSecretKey { secret: String, key: &'static str },
    #[error("client certificate and key do not form a key pair: {reason}")]
    InvalidKeyPair { reason: String },
    #[error("no broker address configured")]
    NoBroker,
    #[error("building admin client: {reason}")]
    Client { reason: String },
}

/// PEM client material read from the cluster's TLS secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub ca_cert: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("client_cert", &format_args!("<{} bytes>", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .field("ca_cert", &format_args!("<{} bytes>", self.ca_cert.len()))
            .finish()
    }
}

impl TlsMaterial {
    /// Refuse material that cannot make up a client identity before any
    /// connection is attempted.
    pub fn check_key_pair(&self) -> Result<(), ConnectError> {
        let invalid = |reason: String| ConnectError::InvalidKeyPair { reason };
        let certs = pem_labels(&self.client_cert).map_err(|e| invalid(format!("{}: {}", CLIENT_CERT_KEY, e)))?;
        if !certs.iter().any(|l| l == "CERTIFICATE") {
            return Err(invalid(format!("{} holds no CERTIFICATE block", CLIENT_CERT_KEY)));
        }
        let keys = pem_labels(&self.client_key).map_err(|e| invalid(format!("{}: {}", CLIENT_KEY_KEY, e)))?;
        if !keys.iter().any(|l| l.ends_with("PRIVATE KEY")) {
            return Err(invalid(format!("{} holds no PRIVATE KEY block", CLIENT_KEY_KEY)));
        }
        let cas = pem_labels(&self.ca_cert).map_err(|e| invalid(format!("{}: {}", CA_CERT_KEY, e)))?;
        if !cas.iter().any(|l| l == "CERTIFICATE") {
            return Err(invalid(format!("{} holds no CERTIFICATE block", CA_CERT_KEY)));
        }
        Ok(())
    }
}

/// Labels of the PEM blocks in `data`, in order.
fn pem_labels(data: &[u8]) -> Result<Vec<String>, String> {
    let text = std::str::from_utf8(data).map_err(|_| "not PEM text".to_string())?;
    let mut labels = Vec::new();
    let mut open: Option<(&str, usize)> = None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(label) = line.strip_prefix("-----BEGIN ").and_then(|l| l.strip_suffix("-----")) {
            if let Some((outer, _)) = open {
                return Err(format!("BEGIN {} inside {}", label, outer));
            }
            open = Some((label, 0));
        } else if let Some(label) = line.strip_prefix("-----END ").and_then(|l| l.strip_suffix("-----")) {
            match open.take() {
                Some((begun, body)) if begun == label && body > 0 => labels.push(label.to_string()),
                Some((begun, _)) if begun == label => return Err(format!("empty {} block", label)),
                _ => return Err(format!("END {} without matching BEGIN", label)),
            }
        } else if let Some((_, body)) = open.as_mut() {
            if !line.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=') {
                return Err("block body is not base64".to_string());
            }
            *body += line.len();
        }
    }
    match open {
        Some((label, _)) => Err(format!("unterminated {} block", label)),
        None if labels.is_empty() => Err("no PEM block".to_string()),
        None => Ok(labels),
    }
}

/// Where secret data comes from.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, ConnectError>;
}

pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SecretSource for KubeSecrets {
    async fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, ConnectError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|e| ConnectError::SecretUnavailable {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(secret.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}

/// Options for building an admin client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConnection {
    pub broker_uri: String,
    pub use_tls: bool,
    pub tls: Option<TlsMaterial>,
    pub ssl_key_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_ca_file: Option<String>,
    pub insecure_skip_verify: bool,
    pub issuer_ca: Option<String>,
    pub issuer_ca_kind: Option<String>,
    pub operation_timeout: Duration,
}

/// Printable view with secret material reduced to its presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub broker_uri: String,
    pub use_tls: bool,
    pub tls_material: bool,
    pub ssl_key_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_ca_file: Option<String>,
    pub insecure_skip_verify: bool,
    pub issuer_ca: Option<String>,
    pub issuer_ca_kind: Option<String>,
    pub operation_timeout_secs: u64,
}

/// True only for `true` in any letter case.
pub fn parse_bool(raw: Option<&str>) -> bool {
    raw.map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn parse_timeout(raw: Option<&str>) -> Duration {
    match raw.filter(|s| !s.is_empty()) {
        None => {
            info!("{} is not set, using default", ENV_OPERATION_TIMEOUT);
            DEFAULT_ADMIN_TIMEOUT
        }
        Some(s) => match s.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(value = %s, "{} is not a valid integer, using default", ENV_OPERATION_TIMEOUT);
                DEFAULT_ADMIN_TIMEOUT
            }
        },
    }
}

/// In-cluster bootstrap address from the first internal listener.
pub fn broker_address(cluster: &ClusterRef) -> Result<String, ConnectError> {
    let port = cluster
        .internal_listeners
        .first()
        .map(|l| l.container_port)
        .ok_or_else(|| ConnectError::NoInternalListener { cluster: cluster.name.clone() })?;
    Ok(if cluster.headless_service_enabled {
        format!("{}.{}:{}", cluster.headless_service_name(), cluster.namespace, port)
    } else {
        format!("{}.{}.svc.cluster.local:{}", cluster.all_broker_service_name(), cluster.namespace, port)
    })
}

fn required(data: &BTreeMap<String, Vec<u8>>, secret: &str, key: &'static str) -> Result<Vec<u8>, ConnectError> {
    data.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConnectError::MissingSecretKey { secret: secret.to_string(), key })
}

impl AdminConnection {
    /// Standalone mode: everything from `KAFKA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.is_empty());
        Self {
            broker_uri: lookup(ENV_BROKER).unwrap_or_default(),
            use_tls: parse_bool(lookup(ENV_USE_SSL).as_deref()),
            tls: None,
            ssl_key_file: non_empty(ENV_SSL_KEY_FILE),
            ssl_cert_file: non_empty(ENV_SSL_CERT_FILE),
            ssl_ca_file: non_empty(ENV_SSL_CA_FILE),
            insecure_skip_verify: parse_bool(lookup(ENV_INSECURE_SKIP_VERIFY).as_deref()),
            issuer_ca: non_empty(ENV_ISSUER_CA_NAME),
            issuer_ca_kind: non_empty(ENV_ISSUER_CA_KIND),
            operation_timeout: parse_timeout(lookup(ENV_OPERATION_TIMEOUT).as_deref()),
        }
    }

    /// Operator mode: address from the cluster's services, TLS from its secret.
    pub async fn for_cluster(secrets: &dyn SecretSource, cluster: &ClusterRef) -> Result<Self, ConnectError> {
        let mut conn = Self {
            broker_uri: broker_address(cluster)?,
            use_tls: false,
            tls: None,
            ssl_key_file: None,
            ssl_cert_file: None,
            ssl_ca_file: None,
            insecure_skip_verify: false,
            issuer_ca: None,
            issuer_ca_kind: None,
            operation_timeout: DEFAULT_ADMIN_TIMEOUT,
        };
        if let Some(secret) = &cluster.tls_secret_name {
            let data = secrets.secret_data(&cluster.namespace, secret).await?;
            let tls = TlsMaterial {
                client_cert: required(&data, secret, CLIENT_CERT_KEY)?,
                client_key: required(&data, secret, CLIENT_KEY_KEY)?,
                ca_cert: required(&data, secret, CA_CERT_KEY)?,
            };
            tls.check_key_pair()?;
            conn.tls = Some(tls);
            conn.use_tls = true;
            conn.issuer_ca = Some(cluster.issuer_name());
            conn.issuer_ca_kind = Some("ClusterIssuer".to_string());
        }
        Ok(conn)
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            broker_uri: self.broker_uri.clone(),
            use_tls: self.use_tls,
            tls_material: self.tls.is_some(),
            ssl_key_file: self.ssl_key_file.clone(),
            ssl_cert_file: self.ssl_cert_file.clone(),
            ssl_ca_file: self.ssl_ca_file.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            issuer_ca: self.issuer_ca.clone(),
            issuer_ca_kind: self.issuer_ca_kind.clone(),
            operation_timeout_secs: self.operation_timeout.as_secs(),
        }
    }
}
