//! Error types for keywarden
//!
//! Every failure a caller can act on has its own variant so the HTTP layer can
//! map it to a status code without inspecting message text.

use hyper::StatusCode;

/// Main error type for keywarden operations
#[derive(Debug, thiserror::Error)]
pub enum KeywardenError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Fingerprint could not be resolved to a resident key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key is resident but carries no secret material.
    #[error("Private key missing for {0}")]
    PrivateKeyMissing(String),

    #[error("Invalid passphrase: {0}")]
    InvalidPassphrase(String),

    #[error("Key {0} is not unlocked")]
    KeyNotUnlocked(String),

    #[error("no unlocked key for decrypting packet (recipients: {0})")]
    NoUnlockedKeyForDecryption(String),

    /// Escrow has no usable master key.
    #[error("Escrow degraded: {0}")]
    DegradedEscrow(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("OpenPGP error: {0}")]
    Pgp(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeywardenError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PrivateKeyMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidPassphrase(_) => StatusCode::UNAUTHORIZED,
            Self::KeyNotUnlocked(_) => StatusCode::CONFLICT,
            Self::NoUnlockedKeyForDecryption(_) => StatusCode::CONFLICT,
            Self::DegradedEscrow(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::Pgp(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for KeywardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for KeywardenError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<base64::DecodeError> for KeywardenError {
    fn from(err: base64::DecodeError) -> Self {
        Self::BadRequest(format!("base64 error: {}", err))
    }
}

impl From<hyper::Error> for KeywardenError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<reqwest::Error> for KeywardenError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Sequoia reports everything through `anyhow::Error`.
impl From<anyhow::Error> for KeywardenError {
    fn from(err: anyhow::Error) -> Self {
        Self::Pgp(format!("{:#}", err))
    }
}

/// Result type alias for keywarden operations
pub type Result<T> = std::result::Result<T, KeywardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            KeywardenError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            KeywardenError::InvalidPassphrase("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            KeywardenError::DegradedEscrow("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_into_status_code_and_body() {
        let (status, body) =
            KeywardenError::KeyNotUnlocked("0123456789ABCDEF".into()).into_status_code_and_body();
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("0123456789ABCDEF"));
    }
}
