//! Wire models shared by the custodian and the HTTP layer.
//!
//! Field names are PascalCase to stay compatible with existing clients.

use serde::{Deserialize, Serialize};

/// Summary of a resident or cached key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyInfo {
    pub finger_print: String,
    pub identifier: String,
    pub bits: usize,
    pub contains_private_key: bool,
    pub private_key_is_decrypted: bool,
}

/// Result of decrypting a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DecryptedData {
    /// Key entry that decrypted the message (master key when resolved via a subkey)
    pub finger_print: String,
    pub base64_data: String,
    pub filename: String,
    pub is_integrity_protected: bool,
    #[serde(rename = "IsIntegrityOK")]
    pub is_integrity_ok: bool,
}
