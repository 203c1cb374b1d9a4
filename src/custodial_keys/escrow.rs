//! Secret escrow for key passphrases.
//!
//! Passphrases supplied to one replica are encrypted under the cluster-wide
//! master key and kept here, so peers can fetch the ciphertext and unlock
//! their own copies of the same keys.
//!
//! # Security
//!
//! - Plaintext passphrases are never stored or returned; only ciphertext
//!   under the master key leaves this module
//! - Passphrases decrypted for a local unlock are zeroized after use
//!
//! # Degraded mode
//!
//! Without a readable master key the escrow still constructs. Writes are
//! ignored, reads are empty, and nothing is ever unlocked. A node in this
//! state keeps serving keys that are already unlocked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::cache::{KeyRing, KeyRingConfig};
use super::crypto;
use super::service::{KeyCustodian, KeyCustodianConfig};
use crate::directory::NoDirectory;
use crate::storage::MemoryBackend;
use crate::types::{KeywardenError, Result};

/// Literal filename carried inside each escrowed ciphertext.
pub fn escrow_filename(fp: &str) -> String {
    format!("key-password-utf8-{}.txt", fp)
}

#[derive(Debug, Clone, Default)]
pub struct SecretEscrowConfig {
    pub master_key_path: Option<PathBuf>,
    pub master_key_password_path: Option<PathBuf>,

    /// Both master files are base64 wrapped
    pub base64_encoded: bool,
}

struct MasterKey {
    custodian: KeyCustodian,
    fingerprint: String,
}

pub struct SecretEscrow {
    passphrases: Mutex<HashMap<String, String>>,
    master: Option<MasterKey>,
}

impl SecretEscrow {
    /// Load the master key described by `config`.
    ///
    /// Missing or unreadable master files degrade the escrow. A master key
    /// that has no private part or will not unlock is a configuration error.
    pub async fn new(config: &SecretEscrowConfig) -> Result<Self> {
        let (Some(key_path), Some(password_path)) =
            (&config.master_key_path, &config.master_key_password_path)
        else {
            warn!("No master key configured, escrow degraded");
            return Ok(Self::degraded());
        };

        let armored = match read_master_file(key_path, config.base64_encoded).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(armored) => armored,
                Err(e) => {
                    error!(path = %key_path.display(), error = %e, "Master key is not text, escrow degraded");
                    return Ok(Self::degraded());
                }
            },
            Err(e) => {
                error!(path = %key_path.display(), error = %e, "Cannot load master key, escrow degraded");
                return Ok(Self::degraded());
            }
        };

        if let Err(e) = crypto::parse_certs(armored.as_bytes()) {
            error!(path = %key_path.display(), error = %e, "Master key is unusable, escrow degraded");
            return Ok(Self::degraded());
        }

        let raw_password = match tokio::fs::read(password_path).await {
            Ok(raw) => Zeroizing::new(raw),
            Err(e) => {
                error!(path = %password_path.display(), error = %e, "Cannot read master key password, escrow degraded");
                return Ok(Self::degraded());
            }
        };
        let password = if config.base64_encoded {
            let text = String::from_utf8_lossy(&raw_password);
            Zeroizing::new(BASE64.decode(text.trim()).map_err(|e| {
                KeywardenError::Config(format!("cannot decode master key password: {}", e))
            })?)
        } else {
            raw_password
        };
        let password = std::str::from_utf8(&password)
            .map_err(|e| KeywardenError::Config(format!("master key password is not UTF-8: {}", e)))?;

        Self::with_master_key(&armored, password.trim_matches(['\n', '\r'])).await
    }

    /// Build an escrow around an armored master key and its passphrase.
    pub async fn with_master_key(armored: &str, passphrase: &str) -> Result<Self> {
        let keyring = Arc::new(KeyRing::new(KeyRingConfig::default(), Arc::new(NoDirectory)));
        let custodian = KeyCustodian::new(
            KeyCustodianConfig::default(),
            keyring,
            Arc::new(MemoryBackend::new()),
        );

        let loaded = custodian
            .load_key(armored)
            .await
            .map_err(|e| KeywardenError::Config(format!("cannot load master key: {}", e)))?;
        if loaded == 0 {
            return Err(KeywardenError::Config(
                "master key does not contain a private key".to_string(),
            ));
        }

        let fingerprint = custodian
            .get_loaded_private_keys()
            .await
            .into_iter()
            .next()
            .map(|info| info.finger_print)
            .ok_or_else(|| KeywardenError::Config("master key vanished after load".to_string()))?;

        custodian
            .unlock_key(&fingerprint, passphrase)
            .await
            .map_err(|e| {
                KeywardenError::Config(format!("cannot unlock master key {}: {}", fingerprint, e))
            })?;

        info!(fingerprint = %fingerprint, "Master key loaded");
        Ok(Self {
            passphrases: Mutex::new(HashMap::new()),
            master: Some(MasterKey {
                custodian,
                fingerprint,
            }),
        })
    }

    /// Escrow without a master key.
    pub fn degraded() -> Self {
        Self {
            passphrases: Mutex::new(HashMap::new()),
            master: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.master.is_none()
    }

    pub fn master_fingerprint(&self) -> Option<&str> {
        self.master.as_ref().map(|m| m.fingerprint.as_str())
    }

    pub async fn len(&self) -> usize {
        self.passphrases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Encrypt `passphrase` under the master key and store it for `fp`.
    pub async fn put_key_passphrase(&self, fp: &str, passphrase: &str) {
        let Some(master) = &self.master else {
            warn!(fingerprint = %fp, "Not saving passphrase, master key not loaded");
            return;
        };

        let ciphertext = match master
            .custodian
            .encrypt(
                &escrow_filename(fp),
                &master.fingerprint,
                passphrase.as_bytes(),
                true,
            )
            .await
        {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                error!(fingerprint = %fp, error = %e, "Cannot escrow passphrase");
                return;
            }
        };

        info!(fingerprint = %fp, "Escrowed passphrase");
        self.passphrases
            .lock()
            .await
            .insert(fp.to_string(), ciphertext);
    }

    /// Store a ciphertext received from a peer, verbatim.
    pub async fn put_encrypted_passphrase(&self, fp: &str, ciphertext: &str) {
        if self.is_degraded() {
            warn!(fingerprint = %fp, "Not saving passphrase, master key not loaded");
            return;
        }
        debug!(fingerprint = %fp, "Stored escrowed passphrase");
        self.passphrases
            .lock()
            .await
            .insert(fp.to_string(), ciphertext.to_string());
    }

    /// Copy of every escrowed ciphertext.
    pub async fn get_passphrases(&self) -> HashMap<String, String> {
        if self.is_degraded() {
            return HashMap::new();
        }
        self.passphrases.lock().await.clone()
    }

    /// Unlock every locked key in `custodian` we hold a passphrase for.
    ///
    /// Returns the number of keys unlocked; per-key failures are logged.
    pub async fn unlock_local_keys(&self, custodian: &KeyCustodian) -> usize {
        let Some(master) = &self.master else {
            warn!("Not unlocking keys, master key not loaded");
            return 0;
        };

        let passphrases = self.passphrases.lock().await.clone();
        let mut unlocked = 0;
        for (fp, ciphertext) in passphrases {
            if !custodian.is_key_locked(&fp).await {
                continue;
            }

            info!(fingerprint = %fp, "Unlocking key from escrow");
            let data_only = !is_armored(&ciphertext);
            let decrypted = match master.custodian.decrypt(&ciphertext, data_only).await {
                Ok(decrypted) => decrypted,
                Err(e) => {
                    error!(fingerprint = %fp, error = %e, "Cannot decrypt escrowed passphrase");
                    continue;
                }
            };
            let passphrase = match BASE64.decode(&decrypted.base64_data) {
                Ok(bytes) => Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    error!(fingerprint = %fp, error = %e, "Cannot decode escrowed passphrase");
                    continue;
                }
            };

            match custodian.unlock_key(&fp, &passphrase).await {
                Ok(()) => unlocked += 1,
                Err(e) => error!(fingerprint = %fp, error = %e, "Cannot unlock key from escrow"),
            }
        }
        unlocked
    }
}

/// Peers may send ASCII armored ciphertext instead of base64 binary.
fn is_armored(ciphertext: &str) -> bool {
    ciphertext.trim_start().starts_with("-----BEGIN PGP")
}

async fn read_master_file(path: &Path, base64_encoded: bool) -> Result<Vec<u8>> {
    let bytes = tokio::fs::read(path).await?;
    if base64_encoded {
        let text = String::from_utf8_lossy(&bytes);
        Ok(BASE64.decode(text.trim())?)
    } else {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodial_keys::crypto::{self, testing::test_cert};
    use sequoia_openpgp::cert::CipherSuite;

    const PASSPHRASE: &str = "correct horse battery staple";

    fn custodian() -> KeyCustodian {
        let keyring = Arc::new(KeyRing::new(KeyRingConfig::default(), Arc::new(NoDirectory)));
        KeyCustodian::new(
            KeyCustodianConfig::default(),
            keyring,
            Arc::new(MemoryBackend::new()),
        )
    }

    async fn escrow() -> SecretEscrow {
        let master = test_cert("Master", "master-pw");
        SecretEscrow::with_master_key(&crypto::armor_secret(&master).unwrap(), "master-pw")
            .await
            .unwrap()
    }

    fn write_master_files(dir: &Path, armored: &str, password: &str, base64: bool) -> SecretEscrowConfig {
        let key_path = dir.join("master.key");
        let password_path = dir.join("master.pass");
        if base64 {
            std::fs::write(&key_path, BASE64.encode(armored)).unwrap();
            std::fs::write(&password_path, BASE64.encode(password)).unwrap();
        } else {
            std::fs::write(&key_path, armored).unwrap();
            std::fs::write(&password_path, password).unwrap();
        }
        SecretEscrowConfig {
            master_key_path: Some(key_path),
            master_key_password_path: Some(password_path),
            base64_encoded: base64,
        }
    }

    #[tokio::test]
    async fn test_degraded_without_config() {
        let escrow = SecretEscrow::new(&SecretEscrowConfig::default()).await.unwrap();
        assert!(escrow.is_degraded());
        assert!(escrow.master_fingerprint().is_none());
    }

    #[tokio::test]
    async fn test_degraded_on_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = SecretEscrowConfig {
            master_key_path: Some(dir.path().join("missing.key")),
            master_key_password_path: Some(dir.path().join("missing.pass")),
            base64_encoded: false,
        };
        let escrow = SecretEscrow::new(&config).await.unwrap();
        assert!(escrow.is_degraded());

        escrow.put_key_passphrase("0123456789ABCDEF", PASSPHRASE).await;
        escrow
            .put_encrypted_passphrase("0123456789ABCDEF", "ciphertext")
            .await;
        assert!(escrow.get_passphrases().await.is_empty());

        let custodian = custodian();
        let cert = test_cert("Locked", PASSPHRASE);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 0);
        assert!(custodian.is_key_locked(&crypto::cert_fingerprint(&cert)).await);
    }

    #[tokio::test]
    async fn test_degraded_on_missing_password_file() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_cert("Master", "master-pw");
        let mut config =
            write_master_files(dir.path(), &crypto::armor_secret(&master).unwrap(), "x", false);
        config.master_key_password_path = Some(dir.path().join("absent"));

        assert!(SecretEscrow::new(&config).await.unwrap().is_degraded());
    }

    #[tokio::test]
    async fn test_degraded_on_garbage_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_master_files(dir.path(), "not a key", "master-pw", false);

        assert!(SecretEscrow::new(&config).await.unwrap().is_degraded());
    }

    #[tokio::test]
    async fn test_public_master_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_cert("Master", "master-pw");
        let config =
            write_master_files(dir.path(), &crypto::armor_public(&master).unwrap(), "master-pw", false);

        let err = SecretEscrow::new(&config).await.err().unwrap();
        assert!(matches!(err, KeywardenError::Config(_)));
    }

    #[tokio::test]
    async fn test_wrong_master_password_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_cert("Master", "master-pw");
        let config =
            write_master_files(dir.path(), &crypto::armor_secret(&master).unwrap(), "wrong", false);

        assert!(SecretEscrow::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_load_from_files_trims_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_cert("Master", "master-pw");
        let config = write_master_files(
            dir.path(),
            &crypto::armor_secret(&master).unwrap(),
            "master-pw\r\n",
            false,
        );

        let escrow = SecretEscrow::new(&config).await.unwrap();
        assert!(!escrow.is_degraded());
        assert_eq!(
            escrow.master_fingerprint(),
            Some(crypto::cert_fingerprint(&master).as_str())
        );
    }

    #[tokio::test]
    async fn test_load_from_base64_files() {
        let dir = tempfile::tempdir().unwrap();
        let master = test_cert("Master", "master-pw");
        let config =
            write_master_files(dir.path(), &crypto::armor_secret(&master).unwrap(), "master-pw", true);

        assert!(!SecretEscrow::new(&config).await.unwrap().is_degraded());
    }

    #[tokio::test]
    async fn test_escrow_round_trip_unlocks_key() {
        let escrow = escrow().await;
        let custodian = custodian();
        let cert = test_cert("Escrowed", PASSPHRASE);
        let fp = crypto::cert_fingerprint(&cert);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();

        escrow.put_key_passphrase(&fp, PASSPHRASE).await;

        let stored = escrow.get_passphrases().await;
        let ciphertext = stored.get(&fp).unwrap();
        assert!(!ciphertext.contains(PASSPHRASE));
        assert!(BASE64.decode(ciphertext).is_ok());

        assert_eq!(escrow.unlock_local_keys(&custodian).await, 1);
        assert!(!custodian.is_key_locked(&fp).await);

        // Already unlocked keys are skipped
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 0);
    }

    #[tokio::test]
    async fn test_escrow_unicode_passphrase() {
        let passphrase = "pässwörd-🔑-密码";
        let escrow = escrow().await;
        let custodian = custodian();
        let cert = test_cert("Unicode", passphrase);
        let fp = crypto::cert_fingerprint(&cert);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();

        escrow.put_key_passphrase(&fp, passphrase).await;
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 1);
    }

    #[tokio::test]
    async fn test_escrow_empty_passphrase() {
        let escrow = escrow().await;
        let custodian = custodian();
        let cert = crypto::generate_cert("Open", "", CipherSuite::Cv25519).unwrap();
        let fp = crypto::cert_fingerprint(&cert);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();

        escrow.put_key_passphrase(&fp, "").await;
        assert!(escrow.get_passphrases().await.contains_key(&fp));
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 1);
    }

    #[tokio::test]
    async fn test_escrow_ciphertext_is_portable() {
        // Two replicas sharing the master key
        let master = test_cert("Master", "master-pw");
        let armored_master = crypto::armor_secret(&master).unwrap();
        let a = SecretEscrow::with_master_key(&armored_master, "master-pw").await.unwrap();
        let b = SecretEscrow::with_master_key(&armored_master, "master-pw").await.unwrap();

        let cert = test_cert("Shared", PASSPHRASE);
        let fp = crypto::cert_fingerprint(&cert);
        a.put_key_passphrase(&fp, PASSPHRASE).await;

        for (key, ciphertext) in a.get_passphrases().await {
            b.put_encrypted_passphrase(&key, &ciphertext).await;
        }

        let custodian = custodian();
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();
        assert_eq!(b.unlock_local_keys(&custodian).await, 1);
    }

    #[tokio::test]
    async fn test_armored_peer_ciphertext_unlocks_key() {
        let escrow = escrow().await;
        let custodian = custodian();
        let cert = test_cert("Armored", PASSPHRASE);
        let fp = crypto::cert_fingerprint(&cert);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();

        let master = escrow.master.as_ref().unwrap();
        let armored = master
            .custodian
            .encrypt(&escrow_filename(&fp), &master.fingerprint, PASSPHRASE.as_bytes(), false)
            .await
            .unwrap();
        assert!(is_armored(&armored));

        escrow.put_encrypted_passphrase(&fp, &armored).await;
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 1);
        assert!(!custodian.is_key_locked(&fp).await);
    }

    #[test]
    fn test_is_armored() {
        assert!(is_armored("-----BEGIN PGP MESSAGE-----\n\nwcBMA\n"));
        assert!(is_armored("\n  -----BEGIN PGP MESSAGE-----"));
        assert!(!is_armored("hQEMA5ZtRHGUw8k4AQf+"));
    }

    #[tokio::test]
    async fn test_bad_ciphertext_is_skipped() {
        let escrow = escrow().await;
        let custodian = custodian();
        let cert = test_cert("Skipped", PASSPHRASE);
        let fp = crypto::cert_fingerprint(&cert);
        custodian
            .load_key(&crypto::armor_secret(&cert).unwrap())
            .await
            .unwrap();

        escrow.put_encrypted_passphrase(&fp, "not-a-ciphertext").await;
        assert_eq!(escrow.unlock_local_keys(&custodian).await, 0);
        assert!(custodian.is_key_locked(&fp).await);
    }
}
