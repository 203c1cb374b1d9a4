//! Bounded public-key cache with remote directory fallback.
//!
//! Every key the service has seen (loaded private keys, keys fetched from the
//! directory) is registered here by fingerprint so signatures can be verified
//! and messages encrypted without another round trip.
//!
//! # Eviction
//!
//! - Non-sticky entries are evicted oldest-first once `max_entries` is reached
//! - Sticky entries (keys we hold privately) are never evicted and do not
//!   count against the limit
//! - Subkeys are registered as their own entries with the same stickiness

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sequoia_openpgp::Cert;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::crypto;
use super::models::KeyInfo;
use crate::directory::PublicKeyDirectory;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct KeyRingConfig {
    /// Maximum number of non-sticky entries (0 disables caching of fetched keys)
    pub max_entries: usize,
}

impl Default for KeyRingConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct KeyRingStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub remote_fetches: AtomicU64,
    pub evictions: AtomicU64,
}

impl KeyRingStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KeyRingStatsSnapshot {
        KeyRingStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyRingStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub remote_fetches: u64,
    pub evictions: u64,
}

// =============================================================================
// KeyRing
// =============================================================================

#[derive(Default)]
struct KeyRingInner {
    /// Insertion order of non-sticky entries
    fifo: VecDeque<String>,
    entities: HashMap<String, Cert>,
    info: HashMap<String, KeyInfo>,
}

pub struct KeyRing {
    inner: Mutex<KeyRingInner>,
    directory: Arc<dyn PublicKeyDirectory>,
    config: KeyRingConfig,
    stats: KeyRingStats,
}

impl KeyRing {
    pub fn new(config: KeyRingConfig, directory: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            inner: Mutex::new(KeyRingInner::default()),
            directory,
            config,
            stats: KeyRingStats::default(),
        }
    }

    /// Register a key and all of its subkeys. Secret material is stripped.
    ///
    /// Adding a fingerprint that is already present is a no-op.
    pub async fn add_key(&self, cert: &Cert, sticky: bool) {
        let public = cert.clone().strip_secret_key_material();
        let identifier = crypto::identifier(&public);

        let mut work: Vec<String> = crypto::subkey_fingerprints(&public);
        work.reverse();
        work.push(crypto::cert_fingerprint(&public));

        let mut inner = self.inner.lock().await;
        while let Some(fp) = work.pop() {
            if inner.entities.contains_key(&fp) {
                continue;
            }
            if !sticky {
                if self.config.max_entries == 0 {
                    continue;
                }
                while inner.fifo.len() >= self.config.max_entries {
                    let Some(oldest) = inner.fifo.pop_front() else {
                        break;
                    };
                    inner.entities.remove(&oldest);
                    inner.info.remove(&oldest);
                    KeyRingStats::record(&self.stats.evictions);
                    debug!(fingerprint = %oldest, "Evicted key from keyring");
                }
                inner.fifo.push_back(fp.clone());
            }

            let info = KeyInfo {
                finger_print: fp.clone(),
                identifier: identifier.clone(),
                bits: crypto::key_bits(&public, &fp),
                contains_private_key: false,
                private_key_is_decrypted: false,
            };
            inner.info.insert(fp.clone(), info);
            inner.entities.insert(fp, public.clone());
        }
    }

    pub async fn contains_key(&self, fingerprint: &str) -> bool {
        self.inner.lock().await.entities.contains_key(fingerprint)
    }

    /// Copy of every cached entry's summary.
    pub async fn get_cached_keys(&self) -> Vec<KeyInfo> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<KeyInfo> = inner.info.values().cloned().collect();
        keys.sort_by(|a, b| a.finger_print.cmp(&b.finger_print));
        keys
    }

    /// Look up a key, asking the directory on a miss.
    ///
    /// Fetched keys are cached as non-sticky. Directory failures are logged
    /// and reported as a miss.
    pub async fn get_key(&self, fingerprint: &str) -> Option<Cert> {
        if let Some(cert) = self.inner.lock().await.entities.get(fingerprint) {
            KeyRingStats::record(&self.stats.hits);
            return Some(cert.clone());
        }
        KeyRingStats::record(&self.stats.misses);

        let armored = match self.directory.get_key(fingerprint).await {
            Ok(Some(armored)) => armored,
            Ok(None) => return None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Directory lookup failed");
                return None;
            }
        };
        KeyRingStats::record(&self.stats.remote_fetches);

        let cert = match crypto::parse_certs(armored.as_bytes()) {
            Ok(mut certs) => certs.remove(0),
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Directory returned unusable key");
                return None;
            }
        };

        info!(fingerprint = %fingerprint, "Fetched key from directory");
        self.add_key(&cert, false).await;
        Some(cert.strip_secret_key_material())
    }

    /// Forget a key and its subkey entries.
    pub async fn delete_key(&self, fingerprint: &str) {
        let mut inner = self.inner.lock().await;
        let Some(cert) = inner.entities.get(fingerprint).cloned() else {
            return;
        };

        let mut fps = crypto::subkey_fingerprints(&cert);
        fps.push(crypto::cert_fingerprint(&cert));
        if !fps.iter().any(|fp| fp == fingerprint) {
            fps.push(fingerprint.to_string());
        }
        for fp in &fps {
            inner.entities.remove(fp);
            inner.info.remove(fp);
        }
        inner.fifo.retain(|fp| !fps.contains(fp));
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> KeyRingStatsSnapshot {
        self.stats.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
