//! Post-create scale hook.
//!
//! Fired after a broker pod is created so the rebalancer can move partitions
//! onto the new broker. Best-effort: the cluster may still be bootstrapping,
//! so failures are reported but never fail the pass.

use std::time::Duration;

use anyhow::{Context, Result};
use kora_core::ScaleReport;
use metrics::counter;
use tracing::{info, warn};

/// Notified with the broker id label and namespace of a newly created broker.
#[async_trait::async_trait]
pub trait ScaleSignal: Send + Sync {
    async fn broker_added(&self, broker_id: &str, namespace: &str) -> Result<()>;
}

/// No rebalancer deployed.
pub struct NoScale;

#[async_trait::async_trait]
impl ScaleSignal for NoScale {
    async fn broker_added(&self, _broker_id: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

/// Cruise Control `add_broker` call against the cluster's Cruise Control service.
pub struct CruiseControl {
    http: reqwest::Client,
    cluster_name: String,
    port: u16,
    base_url: Option<String>,
}

pub const CRUISE_CONTROL_PORT: u16 = 8090;

impl CruiseControl {
    pub fn new(cluster_name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().context("building cruise control http client")?;
        Ok(Self { http, cluster_name: cluster_name.into(), port: CRUISE_CONTROL_PORT, base_url: None })
    }

    /// Override the service address, e.g. `http://localhost:8090` through a port-forward.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn endpoint(&self, namespace: &str) -> String {
        let base = match &self.base_url {
            Some(b) => b.trim_end_matches('/').to_string(),
            None => format!("http://{}-cruisecontrol-svc.{}.svc.cluster.local:{}", self.cluster_name, namespace, self.port),
        };
        format!("{}/kafkacruisecontrol/add_broker", base)
    }
}

#[async_trait::async_trait]
impl ScaleSignal for CruiseControl {
    async fn broker_added(&self, broker_id: &str, namespace: &str) -> Result<()> {
        let url = self.endpoint(namespace);
        let resp = self
            .http
            .post(&url)
            .query(&[("brokerid", broker_id), ("dryrun", "false"), ("json", "true")])
            .send()
            .await
            .with_context(|| format!("posting add_broker to {}", url))?;
        resp.error_for_status().with_context(|| format!("cruise control refused add_broker for broker {}", broker_id))?;
        Ok(())
    }
}

/// Run the hook and turn its result into a report; never propagates.
pub async fn notify(signal: &dyn ScaleSignal, broker_id: &str, namespace: &str) -> ScaleReport {
    match signal.broker_added(broker_id, namespace).await {
        Ok(()) => {
            counter!("scale_signal_total", 1u64, "result" => "delivered");
            info!(broker_id, ns = %namespace, "scale signal delivered");
            ScaleReport::Delivered
        }
        Err(e) => {
            counter!("scale_signal_total", 1u64, "result" => "failed");
            warn!(broker_id, ns = %namespace, error = %format!("{:#}", e), "graceful upscale failed, or cluster just started");
            ScaleReport::Failed(format!("{:#}", e))
        }
    }
}
