//! Cluster endpoints under `/__internal`
//!
//! These carry escrowed passphrases between replicas. Payloads are always
//! ciphertext under the master key, never plaintext.

use std::collections::HashMap;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info};

use super::{json_response, ok_response, read_json};
use crate::server::AppState;
use crate::types::Result;

/// `GET /__internal/__getUnlockPasswords`
pub async fn get_unlock_passwords(state: &AppState) -> Result<Response<Full<Bytes>>> {
    let passphrases = state.escrow.get_passphrases().await;
    debug!(count = passphrases.len(), "Serving escrowed passphrases");
    json_response(StatusCode::OK, &passphrases)
}

/// `POST /__internal/__postEncryptedPasswords`
pub async fn post_encrypted_passwords(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let passphrases: HashMap<String, String> = read_json(req).await?;
    debug!(count = passphrases.len(), "Received escrowed passphrases");
    for (fp, ciphertext) in &passphrases {
        state.escrow.put_encrypted_passphrase(fp, ciphertext).await;
    }
    Ok(ok_response())
}

/// `/__internal/__triggerKeyUnlock`
pub async fn trigger_key_unlock(state: &AppState) -> Result<Response<Full<Bytes>>> {
    let unlocked = state.escrow.unlock_local_keys(&state.custodian).await;
    info!(unlocked, "Triggered local key unlock");
    Ok(ok_response())
}
