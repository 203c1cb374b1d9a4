//! OpenPGP operation endpoints under `/gpg`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use sequoia_openpgp::types::HashAlgorithm;
use serde::Deserialize;
use tracing::info;

use super::{json_response, ok_response, read_json, text_response};
use crate::custodial_keys::compact;
use crate::server::AppState;
use crate::types::{KeywardenError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenerateKeyRequest {
    pub identifier: String,
    pub password: String,
    pub bits: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnlockKeyRequest {
    pub finger_print: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignRequest {
    pub finger_print: String,
    pub base64_data: String,
    #[serde(default)]
    pub hash_algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerifySignatureRequest {
    pub base64_data: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptRequest {
    pub finger_print: String,
    pub base64_data: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub data_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DecryptRequest {
    pub ascii_armored_data: String,
    #[serde(default)]
    pub data_only: bool,
}

/// Hash name as sent by clients, e.g. `SHA512` or `sha-256`. Defaults to SHA512.
fn parse_hash(name: Option<&str>) -> Result<HashAlgorithm> {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(HashAlgorithm::SHA512);
    };
    match name.to_ascii_uppercase().replace('-', "").as_str() {
        "SHA224" => Ok(HashAlgorithm::SHA224),
        "SHA256" => Ok(HashAlgorithm::SHA256),
        "SHA384" => Ok(HashAlgorithm::SHA384),
        "SHA512" => Ok(HashAlgorithm::SHA512),
        other => Err(KeywardenError::BadRequest(format!(
            "unsupported hash algorithm {}",
            other
        ))),
    }
}

fn hash_name(hash: HashAlgorithm) -> &'static str {
    match hash {
        HashAlgorithm::SHA224 => "SHA224",
        HashAlgorithm::SHA256 => "SHA256",
        HashAlgorithm::SHA384 => "SHA384",
        _ => "SHA512",
    }
}

fn decode_data(field: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| KeywardenError::BadRequest(format!("{}: {}", field, e)))
}

/// `POST /gpg/generateKey` - armored, passphrase-protected private key
pub async fn handle_generate_key(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: GenerateKeyRequest = read_json(req).await?;

    let min_bits = state.custodian.min_key_bits();
    if data.bits < min_bits {
        return Err(KeywardenError::BadRequest(format!(
            "The key should be at least {} bits length.",
            min_bits
        )));
    }
    if data.password.is_empty() {
        return Err(KeywardenError::BadRequest(
            "You should provide a password.".to_string(),
        ));
    }

    let key = state
        .custodian
        .generate_pgp_key(&data.identifier, &data.password, data.bits)
        .await?;
    Ok(text_response(StatusCode::OK, key))
}

/// `POST /gpg/unlockKey`
///
/// Unlocks the key here and escrows the passphrase so peers can unlock their
/// copies on the next sync cycle.
pub async fn handle_unlock_key(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: UnlockKeyRequest = read_json(req).await?;

    state
        .custodian
        .unlock_key(&data.finger_print, &data.password)
        .await?;

    let fp = state
        .custodian
        .fix_fingerprint(&data.finger_print)
        .await
        .ok_or_else(|| KeywardenError::NotFound(data.finger_print.clone()))?;
    state.escrow.put_key_passphrase(&fp, &data.password).await;

    info!(fingerprint = %fp, "Key unlocked via API");
    Ok(ok_response())
}

/// `POST /gpg/sign` - armored detached signature
pub async fn handle_sign(state: &AppState, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let data: SignRequest = read_json(req).await?;
    let hash = parse_hash(data.hash_algorithm.as_deref())?;
    let bytes = decode_data("Base64Data", &data.base64_data)?;

    let signature = state
        .custodian
        .sign_data(&data.finger_print, &bytes, hash)
        .await?;
    Ok(text_response(StatusCode::OK, signature))
}

/// `POST /gpg/signQuanto` - signature in the compact `FP_HASH_body` form
pub async fn handle_sign_compact(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: SignRequest = read_json(req).await?;
    let hash = parse_hash(data.hash_algorithm.as_deref())?;
    let bytes = decode_data("Base64Data", &data.base64_data)?;

    let signature = state
        .custodian
        .sign_data(&data.finger_print, &bytes, hash)
        .await?;
    let compact = compact::to_compact(&signature, &data.finger_print, hash_name(hash));
    Ok(text_response(StatusCode::OK, compact))
}

/// `POST /gpg/verifySignature`
pub async fn handle_verify_signature(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: VerifySignatureRequest = read_json(req).await?;
    let bytes = decode_data("Base64Data", &data.base64_data)?;
    verify(state, &bytes, &data.signature).await
}

/// `POST /gpg/verifySignatureQuanto` - `Signature` in the compact form
pub async fn handle_verify_signature_compact(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: VerifySignatureRequest = read_json(req).await?;
    let bytes = decode_data("Base64Data", &data.base64_data)?;
    let signature = compact::from_compact(&data.signature)?;
    verify(state, &bytes, &signature).await
}

async fn verify(state: &AppState, data: &[u8], signature: &str) -> Result<Response<Full<Bytes>>> {
    if state.custodian.verify_signature(data, signature).await? {
        Ok(ok_response())
    } else {
        Err(KeywardenError::Pgp(
            "The provided signature is invalid".to_string(),
        ))
    }
}

/// `POST /gpg/encrypt` - armored message, or base64 binary with `DataOnly`
pub async fn handle_encrypt(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: EncryptRequest = read_json(req).await?;
    let bytes = decode_data("Base64Data", &data.base64_data)?;

    let encrypted = state
        .custodian
        .encrypt(&data.filename, &data.finger_print, &bytes, data.data_only)
        .await?;
    Ok(text_response(StatusCode::OK, encrypted))
}

/// `POST /gpg/decrypt`
pub async fn handle_decrypt(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let data: DecryptRequest = read_json(req).await?;
    let decrypted = state
        .custodian
        .decrypt(&data.ascii_armored_data, data.data_only)
        .await?;
    json_response(StatusCode::OK, &decrypted)
}
