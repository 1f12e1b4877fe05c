//! ETag generation and `If-None-Match` matching.
//!
//! Validators are random tokens minted once per cache fill, not content hashes. Two
//! fills of identical bytes therefore get different validators, and a client holding
//! the old one gets a full 200 after a refill.

use super::{CacheError, CacheResult};
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of a generated validator
pub const ETAG_LENGTH: usize = 16;

const DICTIONARY: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// Largest multiple of the dictionary size that fits in a byte; bytes at or above it
// are rejected so every character is equally likely.
const REJECT_ABOVE: u8 = (256 / DICTIONARY.len() * DICTIONARY.len()) as u8;

/// Generate a fresh, cryptographically random alphanumeric validator
pub fn generate_etag() -> CacheResult<String> {
    let mut out = String::with_capacity(ETAG_LENGTH);
    let mut buf = [0u8; ETAG_LENGTH * 2];

    while out.len() < ETAG_LENGTH {
        OsRng.try_fill_bytes(&mut buf).map_err(|e| CacheError::Unavailable {
            message: format!("error generating etag: {}", e),
        })?;

        for byte in buf.iter().copied().filter(|b| *b < REJECT_ABOVE) {
            if out.len() == ETAG_LENGTH {
                break;
            }
            out.push(DICTIONARY[byte as usize % DICTIONARY.len()] as char);
        }
    }

    Ok(out)
}

/// Render a stored validator as a strong ETag header value
pub fn quoted(etag: &str) -> String {
    format!("\"{}\"", etag)
}

/// Whether an `If-None-Match` header value matches the stored validator.
///
/// The header may list several comma-separated, quoted and possibly weak (`W/`)
/// validators. `*` matches any stored validator. An empty stored validator never
/// matches.
pub fn matches(if_none_match: &str, stored: &str) -> bool {
    if stored.is_empty() {
        return false;
    }

    if_none_match.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == stored
    })
}
