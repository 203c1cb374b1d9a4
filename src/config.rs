//! Configuration for keywarden
//!
//! CLI arguments and environment variable handling using clap. Every flag has
//! an environment variable, and a `.env` file is honoured by `main`.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::cluster::ClusterSyncConfig;
use crate::custodial_keys::{KeyCustodianConfig, KeyRingConfig, SecretEscrowConfig};

/// keywarden - clustered PGP key custody
#[derive(Parser, Debug, Clone)]
#[command(name = "keywarden")]
#[command(about = "Clustered PGP key custody with master-key passphrase escrow")]
pub struct Args {
    /// Unique node identifier
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address for the public API
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:5100")]
    pub listen: SocketAddr,

    /// Separate address for the `/__internal` cluster endpoints.
    /// When unset they are served on LISTEN.
    #[arg(long, env = "INTERNAL_LISTEN")]
    pub internal_listen: Option<SocketAddr>,

    /// Port peers are contacted on (defaults to the internal, then public, listen port)
    #[arg(long, env = "CLUSTER_PORT")]
    pub cluster_port: Option<u16>,

    /// Folder holding the encrypted private keys
    #[arg(long, env = "PRIVATE_KEY_FOLDER", default_value = "./keys")]
    pub private_key_folder: PathBuf,

    /// Filename prefix for stored keys
    #[arg(long, env = "KEY_PREFIX", default_value = "")]
    pub key_prefix: String,

    /// Stored keys are base64 wrapped
    #[arg(long, env = "KEYS_BASE64_ENCODED", default_value = "false")]
    pub keys_base64_encoded: bool,

    /// Load keys from storage on first use instead of at startup
    #[arg(long, env = "ON_DEMAND_KEY_LOAD", default_value = "false")]
    pub on_demand_key_load: bool,

    /// Maximum number of fetched public keys kept in memory
    #[arg(long, env = "MAX_KEYRING_CACHE_SIZE", default_value = "1000")]
    pub max_keyring_cache_size: usize,

    /// HKP key server queried for unknown public keys
    #[arg(long, env = "SKS_SERVER")]
    pub sks_server: Option<String>,

    /// Key server request timeout in milliseconds
    #[arg(long, env = "DIRECTORY_TIMEOUT_MS", default_value = "5000")]
    pub directory_timeout_ms: u64,

    /// Armored master private key used to escrow passphrases
    #[arg(long, env = "MASTER_GPG_KEY_PATH")]
    pub master_gpg_key_path: Option<PathBuf>,

    /// File holding the master key passphrase
    #[arg(long, env = "MASTER_GPG_KEY_PASSWORD_PATH")]
    pub master_gpg_key_password_path: Option<PathBuf>,

    /// Master key and passphrase files are base64 wrapped
    #[arg(long, env = "MASTER_GPG_KEY_BASE64_ENCODED", default_value = "false")]
    pub master_gpg_key_base64_encoded: bool,

    /// Comma-separated `host:port` peers, for clusters outside Kubernetes
    #[arg(long, env = "CLUSTER_PEERS")]
    pub cluster_peers: Option<String>,

    /// The `host:port` entry of CLUSTER_PEERS that refers to this node
    #[arg(long, env = "CLUSTER_ADVERTISE")]
    pub cluster_advertise: Option<String>,

    /// Seconds between passphrase sync cycles
    #[arg(long, env = "CLUSTER_SYNC_INTERVAL_SECS", default_value = "60")]
    pub cluster_sync_interval_secs: u64,

    /// Peer request timeout in milliseconds
    #[arg(long, env = "CLUSTER_REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub cluster_request_timeout_ms: u64,

    /// Skip verification of the Kubernetes API certificate
    #[arg(long, env = "IGNORE_KUBERNETES_CA", default_value = "false")]
    pub ignore_kubernetes_ca: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    /// Port peers serve the internal endpoints on
    pub fn cluster_port(&self) -> u16 {
        self.cluster_port
            .or_else(|| self.internal_listen.map(|a| a.port()))
            .unwrap_or_else(|| self.listen.port())
    }

    /// Identifier matched against peer ids when skipping self
    pub fn cluster_self_id(&self) -> String {
        self.cluster_advertise
            .clone()
            .unwrap_or_else(|| self.node_id.to_string())
    }

    /// Static peer list, if one is configured and non-empty
    pub fn static_peers(&self) -> Option<&str> {
        self.cluster_peers
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn keyring_config(&self) -> KeyRingConfig {
        KeyRingConfig {
            max_entries: self.max_keyring_cache_size,
        }
    }

    pub fn custodian_config(&self) -> KeyCustodianConfig {
        KeyCustodianConfig {
            keys_base64_encoded: self.keys_base64_encoded,
            on_demand_key_load: self.on_demand_key_load,
        }
    }

    pub fn escrow_config(&self) -> SecretEscrowConfig {
        SecretEscrowConfig {
            master_key_path: self.master_gpg_key_path.clone(),
            master_key_password_path: self.master_gpg_key_password_path.clone(),
            base64_encoded: self.master_gpg_key_base64_encoded,
        }
    }

    pub fn sync_config(&self) -> ClusterSyncConfig {
        ClusterSyncConfig {
            interval: Duration::from_secs(self.cluster_sync_interval_secs),
            request_timeout: Duration::from_millis(self.cluster_request_timeout_ms),
            ..ClusterSyncConfig::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.master_gpg_key_path.is_some() && self.master_gpg_key_password_path.is_none() {
            return Err(
                "MASTER_GPG_KEY_PASSWORD_PATH is required when MASTER_GPG_KEY_PATH is set"
                    .to_string(),
            );
        }

        if self.cluster_sync_interval_secs == 0 {
            return Err("CLUSTER_SYNC_INTERVAL_SECS must be greater than zero".to_string());
        }

        if self.cluster_request_timeout_ms == 0 {
            return Err("CLUSTER_REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.internal_listen == Some(self.listen) {
            return Err("INTERNAL_LISTEN must differ from LISTEN".to_string());
        }

        Ok(())
    }
}
