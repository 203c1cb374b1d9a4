//! Passphrase gossip between replicas
//!
//! ## Protocol
//!
//! Every cycle, for each ready peer other than this node:
//! 1. `GET /__internal/__getUnlockPasswords` and merge the returned
//!    `fingerprint -> ciphertext` map into the local escrow
//! 2. `POST /__internal/__postEncryptedPasswords` with the local escrow
//!    contents so the peer converges too
//!
//! If any peer contributed a passphrase, one local unlock pass runs at the
//! end of the cycle. Failures never leave this module; they are logged and
//! the loop moves on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PeerDescriptor, PeerDiscovery};
use crate::custodial_keys::{KeyCustodian, SecretEscrow};
use crate::types::{KeywardenError, Result};

pub const GET_UNLOCK_PASSWORDS_PATH: &str = "/__internal/__getUnlockPasswords";
pub const POST_ENCRYPTED_PASSWORDS_PATH: &str = "/__internal/__postEncryptedPasswords";
pub const TRIGGER_KEY_UNLOCK_PATH: &str = "/__internal/__triggerKeyUnlock";

/// Cluster sync configuration
#[derive(Debug, Clone)]
pub struct ClusterSyncConfig {
    /// Pause between cycles
    pub interval: Duration,
    /// Bound on every peer HTTP call
    pub request_timeout: Duration,
    /// Random delay before the first cycle is drawn from this range
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for ClusterSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            jitter_min: Duration::from_secs(1),
            jitter_max: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Stopped,
}

/// What a single cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub peers_contacted: usize,
    pub peers_failed: usize,
    pub passphrases_received: usize,
    pub keys_unlocked: usize,
}

pub struct ClusterSync {
    config: ClusterSyncConfig,
    discovery: Arc<dyn PeerDiscovery>,
    escrow: Arc<SecretEscrow>,
    custodian: Arc<KeyCustodian>,
    client: reqwest::Client,
    state: RwLock<SyncState>,
}

impl ClusterSync {
    pub fn new(
        config: ClusterSyncConfig,
        discovery: Arc<dyn PeerDiscovery>,
        escrow: Arc<SecretEscrow>,
        custodian: Arc<KeyCustodian>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| KeywardenError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            discovery,
            escrow,
            custodian,
            client,
            state: RwLock::new(SyncState::Idle),
        })
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    /// Run the sync loop in the background until `shutdown` turns true or
    /// its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// The sync loop. A cycle that has started always completes; the stop
    /// signal is honoured between cycles and during sleeps.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        *self.state.write().await = SyncState::Running;

        let jitter = self.initial_jitter();
        info!(
            self_id = %self.discovery.self_id(),
            jitter_ms = jitter.as_millis() as u64,
            "Starting cluster sync, waiting before first cycle"
        );

        if !wait_or_stop(&mut shutdown, jitter).await {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let report = self.run_cycle().await;
                info!(
                    peers = report.peers_contacted,
                    failed = report.peers_failed,
                    received = report.passphrases_received,
                    unlocked = report.keys_unlocked,
                    "Cluster sync cycle complete"
                );

                debug!(sleep_ms = self.config.interval.as_millis() as u64, "Sleeping");
                if wait_or_stop(&mut shutdown, self.config.interval).await {
                    break;
                }
            }
        }

        *self.state.write().await = SyncState::Stopped;
        info!("Cluster sync stopped");
    }

    fn initial_jitter(&self) -> Duration {
        let min = self.config.jitter_min.as_millis() as u64;
        let max = (self.config.jitter_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// One pass over every ready peer.
    pub async fn run_cycle(&self) -> SyncCycleReport {
        let mut report = SyncCycleReport::default();

        let peers = match self.discovery.list_ready_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Cannot list peers");
                return report;
            }
        };
        let self_id = self.discovery.self_id();
        let peers: Vec<PeerDescriptor> = peers.into_iter().filter(|p| p.id != self_id).collect();
        debug!(peers = peers.len(), "Checking other nodes");

        for peer in &peers {
            report.peers_contacted += 1;
            match self.sync_with_peer(peer).await {
                Ok(received) => report.passphrases_received += received,
                Err(e) => {
                    report.peers_failed += 1;
                    warn!(peer = %peer.id, url = %peer.base_url(), error = %e, "Peer sync failed");
                }
            }
        }

        if report.passphrases_received > 0 {
            report.keys_unlocked = self.escrow.unlock_local_keys(&self.custodian).await;
        }
        report
    }

    /// Pull the peer's escrow, merge it, push ours back. Returns the number
    /// of entries the peer sent.
    async fn sync_with_peer(&self, peer: &PeerDescriptor) -> Result<usize> {
        let base = peer.base_url();
        let url = format!("{}{}", base, GET_UNLOCK_PASSWORDS_PATH);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeywardenError::PeerUnreachable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(KeywardenError::PeerUnreachable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let remote: HashMap<String, String> = response
            .json()
            .await
            .map_err(|e| KeywardenError::PeerUnreachable(format!("{}: bad body: {}", url, e)))?;

        debug!(peer = %peer.id, count = remote.len(), "Received escrowed passphrases");
        for (fp, ciphertext) in &remote {
            self.escrow.put_encrypted_passphrase(fp, ciphertext).await;
        }

        let local = self.escrow.get_passphrases().await;
        if !local.is_empty() {
            self.push_to_peer(&base, &local).await;
        }
        Ok(remote.len())
    }

    async fn push_to_peer(&self, base: &str, passphrases: &HashMap<String, String>) {
        let url = format!("{}{}", base, POST_ENCRYPTED_PASSWORDS_PATH);
        match self.client.post(&url).json(passphrases).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, count = passphrases.len(), "Pushed escrowed passphrases");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(url = %url, status = %status, body = %body, "Peer rejected escrowed passphrases");
            }
            Err(e) => warn!(url = %url, error = %e, "Cannot push escrowed passphrases"),
        }
    }
}

/// Sleep for `duration` unless stopped first. Returns true when stopped.
async fn wait_or_stop(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
