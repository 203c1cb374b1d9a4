//! Cluster membership and passphrase gossip
//!
//! ## Overview
//!
//! Replicas find each other through a [`PeerDiscovery`] implementation and
//! exchange escrowed passphrases over the internal HTTP endpoints. Two
//! discovery backends are provided:
//!
//! - [`KubernetesDiscovery`]: pods in the current namespace, via the service
//!   account mounted into every pod
//! - [`StaticDiscovery`]: a fixed `host:port` list from configuration

mod kubernetes;
pub mod sync;

pub use kubernetes::KubernetesDiscovery;
pub use sync::{ClusterSync, ClusterSyncConfig, SyncCycleReport, SyncState};

use serde::{Deserialize, Serialize};

use crate::types::{KeywardenError, Result};

/// A peer replica reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn base_url(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

/// Source of cluster membership.
#[async_trait::async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Peers currently able to serve requests. May include this node.
    async fn list_ready_peers(&self) -> Result<Vec<PeerDescriptor>>;

    /// Identifier of this node, matched against `PeerDescriptor::id`.
    fn self_id(&self) -> &str;
}

/// Fixed peer list, e.g. `CLUSTER_PEERS=10.0.0.2:5100,10.0.0.3:5100`.
pub struct StaticDiscovery {
    self_id: String,
    peers: Vec<PeerDescriptor>,
}

impl StaticDiscovery {
    pub fn new(self_id: impl Into<String>, peers: Vec<PeerDescriptor>) -> Self {
        Self {
            self_id: self_id.into(),
            peers,
        }
    }

    /// Parse a comma separated `host:port` list. Each peer's id is its
    /// `host:port` string.
    pub fn parse(self_id: impl Into<String>, list: &str) -> Result<Self> {
        let mut peers = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| KeywardenError::Config(format!("peer {} has no port", entry)))?;
            let port = port
                .parse::<u16>()
                .map_err(|e| KeywardenError::Config(format!("peer {}: {}", entry, e)))?;
            peers.push(PeerDescriptor {
                id: entry.to_string(),
                address: host.trim_matches(['[', ']']).to_string(),
                port,
            });
        }
        Ok(Self::new(self_id, peers))
    }
}

#[async_trait::async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn list_ready_peers(&self) -> Result<Vec<PeerDescriptor>> {
        Ok(self.peers.clone())
    }

    fn self_id(&self) -> &str {
        &self.self_id
    }
}
