//! Key ring endpoints under `/keyRing`

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{json_response, read_json, text_response};
use crate::custodial_keys::crypto;
use crate::server::AppState;
use crate::types::{KeywardenError, Result};

#[derive(Debug, Deserialize)]
struct GetKeyQuery {
    #[serde(rename = "fingerPrint", default)]
    finger_print: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddPrivateKeyRequest {
    pub encrypted_private_key: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub save_to_disk: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddPrivateKeyResponse {
    pub finger_print: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeletePrivateKeyRequest {
    pub finger_print: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StatusResponse {
    status: &'static str,
}

fn fingerprint_from_query(query: Option<&str>) -> Result<String> {
    let query: GetKeyQuery = serde_urlencoded::from_str(query.unwrap_or(""))
        .map_err(|e| KeywardenError::BadRequest(format!("invalid query: {}", e)))?;
    let fp = query.finger_print.trim();
    if fp.is_empty() {
        return Err(KeywardenError::BadRequest("fingerPrint is required".to_string()));
    }
    Ok(fp.to_string())
}

/// `GET /keyRing/getKey?fingerPrint=` - armored public key
pub async fn handle_get_key(state: &AppState, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
    let fp = fingerprint_from_query(query)?;
    let key = state
        .custodian
        .get_public_key_ascii(&fp)
        .await
        .map_err(|_| KeywardenError::NotFound(format!("Key with fingerPrint {} was not found", fp)))?;
    Ok(text_response(StatusCode::OK, key))
}

/// `GET /keyRing/cachedKeys`
pub async fn handle_cached_keys(state: &AppState) -> Result<Response<Full<Bytes>>> {
    json_response(StatusCode::OK, &state.custodian.get_cached_keys().await)
}

/// `GET /keyRing/privateKeys`
pub async fn handle_private_keys(state: &AppState) -> Result<Response<Full<Bytes>>> {
    json_response(StatusCode::OK, &state.custodian.get_loaded_private_keys().await)
}

/// `POST /keyRing/addPrivateKey`
///
/// Loads the key, unlocks and escrows it when a password is given, and
/// optionally persists the armored key. The password itself is never written
/// to storage.
pub async fn handle_add_private_key(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: AddPrivateKeyRequest = read_json(req).await?;

    let certs = crypto::parse_certs(data.encrypted_private_key.as_bytes()).map_err(|_| {
        KeywardenError::BadRequest(
            "Invalid key provided. Check if it is in ASCII armored format.".to_string(),
        )
    })?;
    let fp = certs
        .first()
        .map(crypto::cert_fingerprint)
        .ok_or_else(|| KeywardenError::BadRequest("no keys in payload".to_string()))?;

    let loaded = state.custodian.load_key(&data.encrypted_private_key).await?;
    if loaded == 0 {
        return Err(KeywardenError::NotFound(
            "No private keys found at specified payload".to_string(),
        ));
    }

    if let Some(password) = data.password.as_deref() {
        state.custodian.unlock_key(&fp, password).await?;
        state.escrow.put_key_passphrase(&fp, password).await;
    }

    let public_key = state.custodian.get_public_key_ascii(&fp).await?;

    if data.save_to_disk {
        state
            .custodian
            .save_key(&fp, &data.encrypted_private_key, None)
            .await?;
    }

    info!(fingerprint = %fp, saved = data.save_to_disk, "Private key added");
    json_response(
        StatusCode::OK,
        &AddPrivateKeyResponse {
            finger_print: fp,
            public_key,
        },
    )
}

/// `POST /keyRing/deletePrivateKey`
pub async fn handle_delete_private_key(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: DeletePrivateKeyRequest = read_json(req).await?;
    state.custodian.delete_key(&data.finger_print).await?;
    json_response(StatusCode::OK, &StatusResponse { status: "OK" })
}
