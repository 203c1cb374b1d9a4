//! Remote public-key directory.
//!
//! The KeyRing falls back to a directory when a fingerprint is not cached.
//! The production implementation speaks the HKP lookup protocol used by SKS
//! style keyservers.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use crate::types::{KeywardenError, Result};

/// Source of public keys for fingerprints the KeyRing has not seen.
#[async_trait::async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// Fetch an armored public key. `Ok(None)` means the directory has no key.
    async fn get_key(&self, fingerprint: &str) -> Result<Option<String>>;
}

/// Directory that never has anything.
pub struct NoDirectory;

#[async_trait::async_trait]
impl PublicKeyDirectory for NoDirectory {
    async fn get_key(&self, _fingerprint: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// HKP keyserver client (`/pks/lookup?op=get`).
pub struct HkpDirectory {
    server: String,
    client: reqwest::Client,
}

impl HkpDirectory {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeywardenError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            server: server.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl PublicKeyDirectory for HkpDirectory {
    async fn get_key(&self, fingerprint: &str) -> Result<Option<String>> {
        let url = format!("{}/pks/lookup", self.server);
        let search = format!("0x{}", fingerprint);
        let response = self
            .client
            .get(&url)
            .query(&[("op", "get"), ("options", "mr"), ("search", search.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(fingerprint = %fingerprint, "Key not in directory");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(KeywardenError::Http(format!(
                "directory returned {} for {}",
                response.status(),
                fingerprint
            )));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }
}
