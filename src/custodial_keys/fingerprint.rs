//! Fingerprint helpers.
//!
//! Keys are addressed by the 16 hex character key ID (the low 64 bits of the
//! v4 fingerprint). The short form is the last 8 characters of that.

/// Length of a canonical fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Length of a short fingerprint.
pub const SHORT_FINGERPRINT_LEN: usize = 8;

/// Upper-case and trim a user supplied fingerprint.
pub fn normalize(fp: &str) -> String {
    fp.trim().to_ascii_uppercase()
}

pub fn is_hex(fp: &str) -> bool {
    !fp.is_empty() && fp.chars().all(|c| c.is_ascii_hexdigit())
}

/// True for a normalized 16 character hex fingerprint.
pub fn is_canonical(fp: &str) -> bool {
    fp.len() == FINGERPRINT_LEN && is_hex(fp)
}

/// Short form (suffix) of a canonical fingerprint.
pub fn short_form(fp: &str) -> &str {
    if fp.len() > SHORT_FINGERPRINT_LEN {
        &fp[fp.len() - SHORT_FINGERPRINT_LEN..]
    } else {
        fp
    }
}

/// Resolve a fingerprint to canonical form.
///
/// 16 characters are returned as-is, 8 characters go through `lookup_short`,
/// anything else resolves to `None`.
pub fn resolve<F>(fp: &str, lookup_short: F) -> Option<String>
where
    F: FnOnce(&str) -> Option<String>,
{
    let fp = normalize(fp);
    if !is_hex(&fp) {
        return None;
    }

    match fp.len() {
        FINGERPRINT_LEN => Some(fp),
        SHORT_FINGERPRINT_LEN => lookup_short(&fp),
        _ => None,
    }
}
