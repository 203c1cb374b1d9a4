//! HTTP routes for keywarden
//!
//! Handlers return `Result<Response<Full<Bytes>>>`; the dispatcher in
//! `server::http` turns errors into responses with [`error_response`].

pub mod gpg;
pub mod health;
pub mod internal;
pub mod keyring;

pub use gpg::{
    handle_decrypt, handle_encrypt, handle_generate_key, handle_sign, handle_sign_compact,
    handle_unlock_key, handle_verify_signature, handle_verify_signature_compact,
};
pub use health::health_check;
pub use internal::{get_unlock_passwords, post_encrypted_passwords, trigger_key_unlock};
pub use keyring::{
    handle_add_private_key, handle_cached_keys, handle_delete_private_key, handle_get_key,
    handle_private_keys,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::types::{KeywardenError, Result};

/// Largest request body accepted by any endpoint
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const MIME_JSON: &str = "application/json";
pub const MIME_TEXT: &str = "text/plain";

/// Read and deserialize a JSON request body.
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| KeywardenError::BadRequest(format!("cannot read body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| KeywardenError::Internal(format!("serialization failed: {}", e)))?;
    Ok(response(status, MIME_JSON, Bytes::from(body)))
}

pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    response(status, MIME_TEXT, Bytes::from(body.into()))
}

pub fn ok_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::OK, "OK")
}

pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });
    response(StatusCode::NOT_FOUND, MIME_JSON, Bytes::from(body.to_string()))
}

/// Map an error to a JSON response carrying its status code.
pub fn error_response(err: KeywardenError) -> Response<Full<Bytes>> {
    let (status, message) = err.into_status_code_and_body();
    if status.is_server_error() {
        warn!(status = %status, error = %message, "Request failed");
    }
    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });
    response(status, MIME_JSON, Bytes::from(body.to_string()))
}
