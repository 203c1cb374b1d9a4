//! Kubernetes peer discovery
//!
//! Uses the service account every pod gets mounted at
//! `/run/secrets/kubernetes.io/serviceaccount` to list the pods of its own
//! namespace. A pod is ready when its phase is `Running` and it has an IP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{PeerDescriptor, PeerDiscovery};
use crate::types::{KeywardenError, Result};

pub const SERVICE_ACCOUNT_PATH: &str = "/run/secrets/kubernetes.io/serviceaccount";

const API_SERVER: &str = "https://kubernetes.default.svc";
const RUNNING_PHASE: &str = "Running";

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

pub struct KubernetesDiscovery {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: String,
    self_uid: String,
    port: u16,
}

impl KubernetesDiscovery {
    /// True when a service account token is mounted.
    pub fn in_cluster() -> bool {
        Path::new(SERVICE_ACCOUNT_PATH).join("token").exists()
    }

    /// Connect using the mounted service account and resolve this pod's UID
    /// from its hostname. Peers are contacted on `port`.
    pub async fn connect(port: u16, ignore_ca: bool, timeout: Duration) -> Result<Self> {
        let base = PathBuf::from(SERVICE_ACCOUNT_PATH);
        let token = tokio::fs::read_to_string(base.join("token")).await?;
        let namespace = tokio::fs::read_to_string(base.join("namespace")).await?;

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if ignore_ca {
            warn!("Kubernetes CA verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Ok(pem) = tokio::fs::read(base.join("ca.crt")).await {
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| KeywardenError::Config(format!("Kubernetes CA: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        let client = builder
            .build()
            .map_err(|e| KeywardenError::Config(format!("HTTP client: {}", e)))?;

        let hostname = match std::env::var("HOSTNAME") {
            Ok(hostname) if !hostname.is_empty() => hostname,
            _ => tokio::fs::read_to_string("/etc/hostname")
                .await
                .unwrap_or_default()
                .trim()
                .to_string(),
        };
        let mut discovery = Self {
            client,
            api_server: API_SERVER.to_string(),
            namespace: namespace.trim().to_string(),
            token: token.trim().to_string(),
            self_uid: String::new(),
            port,
        };

        let me: Pod = discovery
            .get_json(&format!("{}/{}", discovery.pods_url(), hostname))
            .await?;
        discovery.self_uid = me.metadata.uid;

        info!(
            namespace = %discovery.namespace,
            hostname = %hostname,
            pod_uid = %discovery.self_uid,
            "Connected to Kubernetes"
        );
        Ok(discovery)
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_server, self.namespace)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KeywardenError::Http(format!(
                "Kubernetes API returned {} for {}",
                response.status(),
                url
            )));
        }
        Ok(response.json().await?)
    }
}

fn ready_peers(pods: PodList, port: u16) -> Vec<PeerDescriptor> {
    pods.items
        .into_iter()
        .filter(|pod| pod.status.phase == RUNNING_PHASE)
        .filter_map(|pod| {
            let address = pod.status.pod_ip.filter(|ip| !ip.is_empty())?;
            Some(PeerDescriptor {
                id: pod.metadata.uid,
                address,
                port,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl PeerDiscovery for KubernetesDiscovery {
    async fn list_ready_peers(&self) -> Result<Vec<PeerDescriptor>> {
        let pods: PodList = self.get_json(&self.pods_url()).await?;
        debug!(pods = pods.items.len(), "Listed pods");
        for pod in &pods.items {
            debug!(name = %pod.metadata.name, phase = %pod.status.phase, "Pod");
        }
        Ok(ready_peers(pods, self.port))
    }

    fn self_id(&self) -> &str {
        &self.self_uid
    }
}
