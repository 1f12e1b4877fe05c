//! # Blob Compression
//!
//! Gzip compression of stored bodies and `Accept-Encoding` negotiation on replay.
//!
//! Bodies at or above [`CompressionPolicy::min_length`] are gzipped before they reach
//! the store. On a hit the compressed bytes go out as-is only when the policy respects
//! client headers and the client accepts gzip; otherwise they are inflated first.

use super::{CacheError, CacheResult, Compression};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Default minimum body size, in bytes, before compression kicks in
pub const DEFAULT_MIN_LENGTH: usize = 500;

/// Compression settings for a cached route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionPolicy {
    /// Compress blobs before writing them to the store
    pub enabled: bool,

    /// Minimum body size in bytes that triggers compression
    pub min_length: usize,

    /// Serve gzip bytes directly to clients that send `Accept-Encoding: gzip`.
    /// When false, stored blobs are always decompressed before serving.
    pub respect_headers: bool,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_length: DEFAULT_MIN_LENGTH,
            respect_headers: false,
        }
    }
}

impl CompressionPolicy {
    /// Whether a body of this size should be compressed
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && len > 0 && len >= self.min_length.max(1)
    }
}

/// Gzip a body
pub fn compress(body: &[u8]) -> CacheResult<Bytes> {
    let to_error = |e: std::io::Error| CacheError::Compression {
        message: format!("error compressing blob: {}", e),
    };

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(body).map_err(to_error)?;
    encoder.finish().map(Bytes::from).map_err(to_error)
}

/// Outcome of inflating a stored blob
#[derive(Debug)]
pub struct Decompressed {
    /// Bytes produced, possibly only a prefix if decoding failed midway
    pub body: Bytes,

    /// Set when decoding stopped early
    pub error: Option<CacheError>,
}

/// Gunzip a body.
///
/// Never fails outright: on a corrupt stream the bytes decoded so far are returned
/// together with the error so the caller can log it and serve what it has.
pub fn decompress(body: &[u8]) -> Decompressed {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::with_capacity(body.len() * 2);

    let error = decoder
        .read_to_end(&mut out)
        .err()
        .map(|e| CacheError::Compression {
            message: format!("error decompressing blob: {}", e),
        });

    Decompressed {
        body: Bytes::from(out),
        error,
    }
}

/// Whether an `Accept-Encoding` header allows the given encoding.
///
/// Honours `*` and explicit `q=0` exclusions.
pub fn accepts(accept_encoding: &str, compression: Compression) -> bool {
    let wanted = compression.as_str();
    if wanted.is_empty() {
        return true;
    }

    let mut wildcard = false;
    for entry in accept_encoding.split(',') {
        let mut parts = entry.split(';').map(str::trim);
        let coding = parts.next().unwrap_or("");
        let refused = parts.any(|param| {
            param
                .strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .map(|q| q <= 0.0)
                .unwrap_or(false)
        });

        if coding.eq_ignore_ascii_case(wanted) {
            return !refused;
        }
        if coding == "*" && !refused {
            wildcard = true;
        }
    }

    wildcard
}
