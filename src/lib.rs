//! keywarden - clustered PGP key custody
//!
//! Every replica holds the same passphrase-protected private keys. Keys are
//! unlocked at runtime, and the passphrase is escrowed under a cluster-wide
//! master key so the other replicas can unlock their own copies.
//!
//! ## Components
//!
//! - **KeyRing**: bounded public-key cache with remote directory fallback
//! - **KeyCustodian**: key lifecycle, sign/verify, encrypt/decrypt
//! - **SecretEscrow**: passphrases encrypted under the master key
//! - **ClusterSync**: periodic passphrase gossip between replicas
//! - **Server**: hyper HTTP API plus the `/__internal` cluster endpoints

pub mod cluster;
pub mod config;
pub mod custodial_keys;
pub mod directory;
pub mod routes;
pub mod server;
pub mod storage;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{KeywardenError, Result};
