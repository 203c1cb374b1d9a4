//! Compact signature form
//!
//! Some clients carry detached signatures as a single token,
//! `{fingerprint}_{hash}_{body}`, where `body` is the armored signature with
//! the header lines and line breaks removed. `$` is accepted as the separator
//! too. The CRC24 checksum line, when present, stays at the end of `body`.

use crate::types::{KeywardenError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

const BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const END: &str = "-----END PGP SIGNATURE-----";
const LINE_WIDTH: usize = 64;

/// `=XXXX`
const CHECKSUM_LEN: usize = 5;

/// Collapse an armored signature into `{fingerprint}_{HASH}_{body}`.
pub fn to_compact(armored: &str, fingerprint: &str, hash: &str) -> String {
    let lines: Vec<&str> = armored
        .trim_matches(|c| c == ' ' || c == '\r' || c == '\n')
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .collect();

    // Between the BEGIN and END lines; armor headers end at the first blank line
    let inner = if lines.len() > 2 { &lines[1..lines.len() - 1] } else { &[][..] };
    let body_start = inner
        .iter()
        .position(|line| line.is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);

    let body: String = inner[body_start..].concat();
    format!("{}_{}_{}", fingerprint, hash.to_uppercase(), body)
}

/// Expand a compact signature back into an armored one.
pub fn from_compact(compact: &str) -> Result<String> {
    let body = split_compact(compact)
        .map(|(_, _, body)| body.trim())
        .filter(|body| !body.is_empty())
        .ok_or_else(|| {
            KeywardenError::BadRequest(
                "signature must look like FINGERPRINT_HASH_SIGNATURE".to_string(),
            )
        })?;

    let (data, checksum) = match body.len().checked_sub(CHECKSUM_LEN) {
        Some(at) if at > 0 && is_checksum(&body[at..]) => (&body[..at], Some(&body[at..])),
        _ => (body, None),
    };

    let mut armored = String::with_capacity(body.len() + body.len() / LINE_WIDTH + 64);
    armored.push_str(BEGIN);
    armored.push_str("\n\n");
    for chunk in data.as_bytes().chunks(LINE_WIDTH) {
        armored.push_str(&String::from_utf8_lossy(chunk));
        armored.push('\n');
    }
    if let Some(checksum) = checksum {
        armored.push_str(checksum);
        armored.push('\n');
    }
    armored.push_str(END);
    armored.push('\n');
    Ok(armored)
}

/// `(fingerprint, hash, body)` split on `$`, falling back to `_`.
fn split_compact(compact: &str) -> Option<(&str, &str, &str)> {
    for separator in ['$', '_'] {
        let parts: Vec<&str> = compact.split(separator).collect();
        if let [fingerprint, hash, body] = parts[..] {
            return Some((fingerprint, hash, body));
        }
    }
    None
}

fn is_checksum(tail: &str) -> bool {
    tail.len() == CHECKSUM_LEN
        && tail.starts_with('=')
        && BASE64.decode(&tail[1..]).map(|crc| crc.len() == 3).unwrap_or(false)
}
