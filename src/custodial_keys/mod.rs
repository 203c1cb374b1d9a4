//! Custodial PGP key management
//!
//! Every replica holds the same encrypted private keys. A key becomes usable
//! only after its passphrase has been supplied at runtime and used to decrypt
//! an in-memory copy.
//!
//! # Architecture
//!
//! - [`KeyRing`]: bounded public-key cache with remote directory fallback
//! - [`KeyCustodian`]: key lifecycle plus sign/verify/encrypt/decrypt
//! - [`SecretEscrow`]: passphrases encrypted under the cluster master key,
//!   gossiped between replicas by `cluster::ClusterSync`
//!
//! # Security
//!
//! - Stored keys are never decrypted in place; unlock decrypts a copy
//! - Passphrases only leave a node as ciphertext under the master key

pub mod cache;
pub mod compact;
pub mod crypto;
pub mod escrow;
pub mod fingerprint;
pub mod models;
pub mod service;

pub use cache::{KeyRing, KeyRingConfig, KeyRingStatsSnapshot};
pub use escrow::{SecretEscrow, SecretEscrowConfig};
pub use models::{DecryptedData, KeyInfo};
pub use service::{KeyCustodian, KeyCustodianConfig};
