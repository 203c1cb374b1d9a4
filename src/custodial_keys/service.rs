//! Key Custodian
//!
//! Owns every private key this node holds and performs all cryptographic
//! operations with them.
//!
//! # Responsibilities
//!
//! - Load keys from the storage backend (bulk at startup or on demand)
//! - Unlock keys with a passphrase, keeping only the decrypted copy
//! - Sign, verify, encrypt and decrypt on behalf of callers
//! - Generate new RSA keys
//!
//! # Locking
//!
//! One mutex guards every map. Key handles are cloned out before any
//! signing or decryption so the lock is never held during crypto work.
//! Lock order is custodian before keyring.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sequoia_openpgp::crypto::KeyPair;
use sequoia_openpgp::types::HashAlgorithm;
use sequoia_openpgp::Cert;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::KeyRing;
use super::crypto;
use super::fingerprint;
use super::models::{DecryptedData, KeyInfo};
use crate::storage::StorageBackend;
use crate::types::{KeywardenError, Result};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct KeyCustodianConfig {
    /// Stored keys are base64 wrapped
    pub keys_base64_encoded: bool,

    /// Skip the bulk load; read keys from storage the first time they are used
    pub on_demand_key_load: bool,
}

// =============================================================================
// State
// =============================================================================

/// A resident key. Synthetic subkey entries share their master's cert and
/// point `key_fingerprint` at the subkey.
#[derive(Clone)]
struct LoadedKey {
    cert: Cert,
    key_fingerprint: String,
}

impl LoadedKey {
    fn has_secret(&self) -> bool {
        crypto::has_secret(&self.cert, &self.key_fingerprint)
    }

    fn is_primary(&self) -> bool {
        crypto::cert_fingerprint(&self.cert) == self.key_fingerprint
    }
}

/// Decrypted key pairs for one entry. The entry's own key comes first,
/// followed by its subkeys.
#[derive(Clone)]
struct UnlockedKey {
    pairs: Vec<KeyPair>,
    signer: usize,
}

impl UnlockedKey {
    fn signing_pair(&self) -> Option<KeyPair> {
        self.pairs.get(self.signer).cloned()
    }
}

#[derive(Deserialize, Default)]
struct KeyMetadata {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Default)]
struct CustodianState {
    entities: HashMap<String, LoadedKey>,
    decrypted: HashMap<String, UnlockedKey>,
    short_index: HashMap<String, String>,
    subkey_to_key: HashMap<String, String>,
}

impl CustodianState {
    fn resolve(&self, fp: &str) -> Option<String> {
        fingerprint::resolve(fp, |short| self.short_index.get(short).cloned())
    }

    fn key_info(&self, fp: &str, entry: &LoadedKey) -> KeyInfo {
        KeyInfo {
            finger_print: fp.to_string(),
            identifier: crypto::identifier(&entry.cert),
            bits: crypto::key_bits(&entry.cert, &entry.key_fingerprint),
            contains_private_key: entry.has_secret(),
            private_key_is_decrypted: self.decrypted.contains_key(fp),
        }
    }

    /// Decrypted pairs for a recipient, directly or through its master key.
    fn pairs_for_recipient(&self, recipient: &str) -> Option<(String, Vec<KeyPair>)> {
        if let Some(unlocked) = self.decrypted.get(recipient) {
            return Some((recipient.to_string(), unlocked.pairs.clone()));
        }
        let master = self.subkey_to_key.get(recipient)?;
        self.decrypted
            .get(master)
            .map(|unlocked| (master.clone(), unlocked.pairs.clone()))
    }
}

// =============================================================================
// Key Custodian
// =============================================================================

pub struct KeyCustodian {
    state: Mutex<CustodianState>,
    keyring: Arc<KeyRing>,
    backend: Arc<dyn StorageBackend>,
    config: KeyCustodianConfig,
}

impl KeyCustodian {
    pub fn new(
        config: KeyCustodianConfig,
        keyring: Arc<KeyRing>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state: Mutex::new(CustodianState::default()),
            keyring,
            backend,
            config,
        }
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    pub fn min_key_bits(&self) -> usize {
        crypto::MIN_KEY_BITS
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Load every key the storage backend holds. Returns the number of
    /// private keys loaded; failures on individual keys are logged.
    pub async fn load_keys(&self) -> usize {
        if self.config.on_demand_key_load {
            warn!("On-demand key load enabled, skipping bulk load");
            return 0;
        }

        info!(
            backend = self.backend.name(),
            path = %self.backend.path(),
            "Loading keys"
        );
        let ids = match self.backend.list().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Cannot list stored keys");
                return 0;
            }
        };

        let mut state = self.state.lock().await;
        let mut loaded = 0;
        for id in ids {
            let result = match self.read_stored_key(&id).await {
                Ok((armored, metadata)) => {
                    self.load_key_with_metadata_locked(&mut state, &armored, &metadata)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(n) => loaded += n,
                Err(e) => error!(key = %id, error = %e, "Failed to load stored key"),
            }
        }

        info!(loaded, "Loaded private keys");
        loaded
    }

    /// Parse an armored keyring and make its keys resident.
    ///
    /// Returns the number of private keys found; public-only keys are still
    /// registered for verification and encryption.
    pub async fn load_key(&self, armored: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let loaded = self.load_key_locked(&mut state, armored).await?;
        Ok(loaded.len())
    }

    /// Like [`load_key`](Self::load_key), then unlock with the `password`
    /// field of `metadata` when present. Unlock failures are logged only.
    pub async fn load_key_with_metadata(&self, armored: &str, metadata: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.load_key_with_metadata_locked(&mut state, armored, metadata)
            .await
    }

    async fn read_stored_key(&self, id: &str) -> Result<(String, String)> {
        let stored = self.backend.read(id).await?;
        let data = if self.config.keys_base64_encoded {
            let bytes = BASE64.decode(stored.data.trim())?;
            String::from_utf8(bytes)
                .map_err(|e| KeywardenError::Storage(format!("key {} is not UTF-8: {}", id, e)))?
        } else {
            stored.data
        };
        Ok((data, stored.metadata))
    }

    async fn load_key_locked(
        &self,
        state: &mut CustodianState,
        armored: &str,
    ) -> Result<Vec<String>> {
        let certs = crypto::parse_certs(armored.as_bytes())?;

        let mut private = Vec::new();
        for cert in certs {
            let fp = crypto::cert_fingerprint(&cert);
            self.keyring.add_key(&cert, true).await;
            state
                .short_index
                .insert(fingerprint::short_form(&fp).to_string(), fp.clone());

            if cert.is_tsk() {
                for sub in crypto::subkey_fingerprints(&cert) {
                    debug!(subkey = %sub, fingerprint = %fp, "Loaded subkey");
                    state.subkey_to_key.insert(sub, fp.clone());
                }
                info!(fingerprint = %fp, "Loaded private key");
                private.push(fp.clone());
            } else {
                info!(fingerprint = %fp, "Loaded public key");
            }

            // A public copy must not shadow a resident private key
            let keep_existing = state
                .entities
                .get(&fp)
                .map(|existing| existing.cert.is_tsk() && !cert.is_tsk())
                .unwrap_or(false);
            if !keep_existing {
                state.entities.insert(
                    fp.clone(),
                    LoadedKey {
                        cert,
                        key_fingerprint: fp,
                    },
                );
            }
        }
        Ok(private)
    }

    async fn load_key_with_metadata_locked(
        &self,
        state: &mut CustodianState,
        armored: &str,
        metadata: &str,
    ) -> Result<usize> {
        let private = self.load_key_locked(state, armored).await?;
        if metadata.trim().is_empty() {
            return Ok(private.len());
        }

        let meta: KeyMetadata = match serde_json::from_str(metadata) {
            Ok(meta) => meta,
            Err(e) => {
                error!(error = %e, "Cannot decode key metadata");
                return Ok(private.len());
            }
        };

        if let Some(password) = meta.password.filter(|p| !p.is_empty()) {
            for fp in &private {
                match Self::unlock_resident(state, fp, &password) {
                    Ok(()) => debug!(fingerprint = %fp, "Key unlocked from metadata"),
                    Err(e) => error!(fingerprint = %fp, error = %e, "Cannot unlock key from metadata"),
                }
            }
        }
        Ok(private.len())
    }

    /// Pull a key from storage if it is not resident. Errors are returned for
    /// logging; callers carry on with whatever is resident.
    async fn load_key_from_backend(&self, state: &mut CustodianState, fp: &str) -> Result<()> {
        if fp.is_empty() || state.entities.contains_key(fp) || state.decrypted.contains_key(fp) {
            return Ok(());
        }

        let (armored, metadata) = self.read_stored_key(fp).await?;
        info!(fingerprint = %fp, "Loading key from storage on demand");
        self.load_key_with_metadata_locked(state, &armored, &metadata)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Unlocking
    // -------------------------------------------------------------------------

    /// Resolve a fingerprint to canonical form; `None` when it is malformed
    /// or an unknown short form.
    pub async fn fix_fingerprint(&self, fp: &str) -> Option<String> {
        self.state.lock().await.resolve(fp)
    }

    /// True unless a decrypted copy of the key is resident.
    pub async fn is_key_locked(&self, fp: &str) -> bool {
        let state = self.state.lock().await;
        match state.resolve(fp) {
            Some(fp) => !state.decrypted.contains_key(&fp),
            None => true,
        }
    }

    /// Unlock a key and every subkey with `passphrase`.
    ///
    /// The stored key stays encrypted; a decrypted copy is kept in memory.
    /// Each subkey also becomes addressable as its own entry.
    pub async fn unlock_key(&self, fp: &str, passphrase: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let resolved = state
            .resolve(fp)
            .ok_or_else(|| KeywardenError::NotFound(format!("no such key {}", fp)))?;

        if let Err(e) = self.load_key_from_backend(&mut state, &resolved).await {
            debug!(fingerprint = %resolved, error = %e, "On-demand load skipped");
        }

        Self::unlock_resident(&mut state, &resolved, passphrase)
    }

    fn unlock_resident(state: &mut CustodianState, fp: &str, passphrase: &str) -> Result<()> {
        let entry = state.entities.get(fp).cloned().ok_or_else(|| {
            error!(fingerprint = %fp, "No such key");
            KeywardenError::NotFound(format!("no such key {}", fp))
        })?;

        let secret = crypto::secret_key(&entry.cert, &entry.key_fingerprint)
            .ok_or_else(|| KeywardenError::PrivateKeyMissing(fp.to_string()))?;
        let own_pair = crypto::unlock(secret, passphrase)?;

        if state.decrypted.contains_key(fp) {
            info!(fingerprint = %fp, "Key already unlocked");
            return Ok(());
        }

        let mut subkeys = Vec::new();
        if entry.is_primary() {
            for (sub_fp, secret) in crypto::secret_subkeys(&entry.cert) {
                debug!(subkey = %sub_fp, fingerprint = %fp, "Decrypting subkey");
                subkeys.push((sub_fp, crypto::unlock(secret, passphrase)?));
            }
        }

        let signing = crypto::signing_key_fingerprints(&entry.cert);
        let mut pairs = vec![own_pair];
        pairs.extend(subkeys.iter().map(|(_, pair)| pair.clone()));
        let signer = pairs
            .iter()
            .position(|pair| signing.contains(&pair.public().keyid().to_hex()))
            .unwrap_or(0);

        for (sub_fp, pair) in subkeys {
            state.subkey_to_key.insert(sub_fp.clone(), fp.to_string());
            state.entities.insert(
                sub_fp.clone(),
                LoadedKey {
                    cert: entry.cert.clone(),
                    key_fingerprint: sub_fp.clone(),
                },
            );
            state.decrypted.insert(
                sub_fp,
                UnlockedKey {
                    pairs: vec![pair],
                    signer: 0,
                },
            );
        }
        state
            .decrypted
            .insert(fp.to_string(), UnlockedKey { pairs, signer });

        info!(fingerprint = %fp, "Key unlocked");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub async fn get_private_key_info(&self, fp: &str) -> Option<KeyInfo> {
        let state = self.state.lock().await;
        let fp = state.resolve(fp)?;
        let entry = state.entities.get(&fp)?;
        entry.has_secret().then(|| state.key_info(&fp, entry))
    }

    /// Summaries of every resident private key (including synthetic subkey entries).
    pub async fn get_loaded_private_keys(&self) -> Vec<KeyInfo> {
        let state = self.state.lock().await;
        let mut keys: Vec<KeyInfo> = state
            .entities
            .iter()
            .filter(|(_, entry)| entry.has_secret())
            .map(|(fp, entry)| state.key_info(fp, entry))
            .collect();
        keys.sort_by(|a, b| a.finger_print.cmp(&b.finger_print));
        keys
    }

    /// Summaries of every resident key, public or private.
    pub async fn get_loaded_keys(&self) -> Vec<KeyInfo> {
        let state = self.state.lock().await;
        let mut keys: Vec<KeyInfo> = state
            .entities
            .iter()
            .map(|(fp, entry)| state.key_info(fp, entry))
            .collect();
        keys.sort_by(|a, b| a.finger_print.cmp(&b.finger_print));
        keys
    }

    pub async fn get_cached_keys(&self) -> Vec<KeyInfo> {
        self.keyring.get_cached_keys().await
    }

    /// Public certificate for a fingerprint.
    ///
    /// Resolution order: resident entries, subkey to master index, KeyRing
    /// (which may ask the remote directory).
    pub async fn get_public_key(&self, fp: &str) -> Option<Cert> {
        let resolved = {
            let state = self.state.lock().await;
            let resolved = state.resolve(fp)?;
            if let Some(entry) = state.entities.get(&resolved) {
                return Some(entry.cert.clone().strip_secret_key_material());
            }
            if let Some(entry) = state
                .subkey_to_key
                .get(&resolved)
                .and_then(|master| state.entities.get(master))
            {
                return Some(entry.cert.clone().strip_secret_key_material());
            }
            resolved
        };

        // Lock released: the directory fetch may be slow
        self.keyring.get_key(&resolved).await
    }

    pub async fn get_public_key_ascii(&self, fp: &str) -> Result<String> {
        let cert = self
            .get_public_key(fp)
            .await
            .ok_or_else(|| KeywardenError::NotFound(format!("public key {}", fp)))?;
        crypto::armor_public(&cert)
    }

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------

    /// Persist an armored key. A `password` is stored in the metadata so the
    /// key unlocks itself when loaded. The write is skipped when storage
    /// already holds identical data.
    pub async fn save_key(&self, fp: &str, armored: &str, password: Option<&str>) -> Result<()> {
        let data = if self.config.keys_base64_encoded {
            BASE64.encode(armored.as_bytes())
        } else {
            armored.to_string()
        };
        let metadata = match password {
            Some(password) => serde_json::json!({ "password": password }).to_string(),
            None => String::new(),
        };

        if let Ok(existing) = self.backend.read(fp).await {
            if existing.data == data && existing.metadata == metadata {
                warn!(fingerprint = %fp, "Key already in storage, skipping save");
                return Ok(());
            }
        }

        info!(fingerprint = %fp, backend = self.backend.name(), "Saving key");
        self.backend.save_with_metadata(fp, &data, &metadata).await
    }

    /// Forget a key and its subkeys everywhere, including storage.
    pub async fn delete_key(&self, fp: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let fp = state
            .resolve(fp)
            .ok_or_else(|| KeywardenError::NotFound(format!("no such key {}", fp)))?;

        let mut forget = vec![fp.clone()];
        if let Some(entry) = state.entities.get(&fp) {
            if entry.is_primary() {
                forget.extend(crypto::subkey_fingerprints(&entry.cert));
            }
        }
        for key in &forget {
            state.decrypted.remove(key);
            state.entities.remove(key);
            state.subkey_to_key.remove(key);
        }
        state
            .short_index
            .retain(|_, full| !forget.iter().any(|f| f == full));

        self.keyring.delete_key(&fp).await;
        drop(state);

        info!(fingerprint = %fp, "Deleting key");
        self.backend.delete(&fp).await
    }

    // -------------------------------------------------------------------------
    // Cryptographic operations
    // -------------------------------------------------------------------------

    /// Detached armored signature with an unlocked key.
    pub async fn sign_data(&self, fp: &str, data: &[u8], hash: HashAlgorithm) -> Result<String> {
        let pair = {
            let mut state = self.state.lock().await;
            let resolved = state
                .resolve(fp)
                .ok_or_else(|| KeywardenError::NotFound(format!("no such key {}", fp)))?;

            if !state.decrypted.contains_key(&resolved) {
                warn!(fingerprint = %resolved, "Key not unlocked, trying storage");
                if let Err(e) = self.load_key_from_backend(&mut state, &resolved).await {
                    debug!(fingerprint = %resolved, error = %e, "On-demand load failed");
                }
            }
            if !state.entities.contains_key(&resolved) && !state.decrypted.contains_key(&resolved) {
                return Err(KeywardenError::NotFound(format!("no such key {}", resolved)));
            }

            state
                .decrypted
                .get(&resolved)
                .and_then(UnlockedKey::signing_pair)
                .ok_or(KeywardenError::KeyNotUnlocked(resolved))?
        };

        crypto::sign_detached(pair, data, hash)
    }

    /// Verify a detached signature against whichever issuer we can resolve.
    ///
    /// `NotFound` when no issuer key is available; `Ok(false)` when the
    /// signature does not match.
    pub async fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool> {
        let issuers = crypto::signature_issuers(signature.as_bytes())?;
        for issuer in &issuers {
            if let Some(cert) = self.get_public_key(issuer).await {
                debug!(issuer = %issuer, "Verifying signature");
                return crypto::verify_detached(&cert, data, signature.as_bytes());
            }
        }

        Err(KeywardenError::NotFound(format!(
            "cannot find public key for any of these signatures: {}",
            issuers.join(", ")
        )))
    }

    /// Encrypt to a key's encryption-capable (sub)keys.
    pub async fn encrypt(
        &self,
        filename: &str,
        fp: &str,
        data: &[u8],
        data_only: bool,
    ) -> Result<String> {
        let cert = self
            .get_public_key(fp)
            .await
            .ok_or_else(|| KeywardenError::NotFound(format!("public key {}", fp)))?;
        crypto::encrypt_to(&cert, filename, data, data_only)
    }

    /// Decrypt a message with the first unlocked recipient key.
    ///
    /// `data_only` payloads are base64 of the binary message, otherwise the
    /// payload is armored (binary is accepted too).
    pub async fn decrypt(&self, payload: &str, data_only: bool) -> Result<DecryptedData> {
        let message = if data_only {
            BASE64.decode(payload.trim())?
        } else {
            payload.as_bytes().to_vec()
        };

        let recipients = crypto::message_recipients(&message)?;
        if recipients.is_empty() {
            return Err(KeywardenError::BadRequest(
                "no encrypted payloads found".to_string(),
            ));
        }

        let (entry_fp, pairs) = {
            let mut state = self.state.lock().await;
            let mut found = None;
            for recipient in &recipients {
                if let Err(e) = self.load_key_from_backend(&mut state, recipient).await {
                    debug!(recipient = %recipient, error = %e, "On-demand load skipped");
                }
                if let Some(master) = state.subkey_to_key.get(recipient).cloned() {
                    if let Err(e) = self.load_key_from_backend(&mut state, &master).await {
                        debug!(fingerprint = %master, error = %e, "On-demand load skipped");
                    }
                }
                found = state.pairs_for_recipient(recipient);
                if found.is_some() {
                    break;
                }
            }
            found.ok_or_else(|| {
                KeywardenError::NoUnlockedKeyForDecryption(recipients.join(", "))
            })?
        };

        let decrypted = crypto::decrypt_message(&message, pairs)?;
        debug!(
            fingerprint = %entry_fp,
            key = %decrypted.key_fingerprint,
            "Decrypted message"
        );

        Ok(DecryptedData {
            finger_print: entry_fp,
            base64_data: BASE64.encode(&decrypted.data),
            filename: decrypted.filename,
            is_integrity_protected: true,
            is_integrity_ok: true,
        })
    }

    /// Generate an armored, passphrase-protected RSA private key.
    ///
    /// `bits` below 2048 are rejected; other sizes round down to 2048, 3072
    /// or 4096.
    pub async fn generate_pgp_key(
        &self,
        identifier: &str,
        passphrase: &str,
        bits: usize,
    ) -> Result<String> {
        let suite = crypto::rsa_suite(bits)?;
        let user_id = crypto::build_user_id(identifier)?;
        let passphrase = zeroize::Zeroizing::new(passphrase.to_string());

        info!(identifier = %user_id, bits, "Generating key");
        let cert = tokio::task::spawn_blocking(move || {
            crypto::generate_cert(&user_id, &passphrase, suite)
        })
        .await
        .map_err(|e| KeywardenError::Internal(format!("key generation task: {}", e)))??;

        crypto::armor_secret(&cert)
    }
}

// =============================================================================
// Tests
// =============================================================================
