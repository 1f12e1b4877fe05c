//! # Cache Key Generator
//!
//! Derives the `uri` part of a cache key from a request. The path is normalized and,
//! depending on the strategy, combined with the query string before being hashed with
//! SHA-256 into a fixed-length hex token.
//!
//! Query parameters are treated as a set ordered by name: `?a=1&b=2` and `?b=2&a=1`
//! produce the same key. With [`KeyGenerationStrategy::WithSelectedQuery`] only the
//! listed parameters count, so unrelated tracking parameters do not fragment the cache.

use crate::core::types::IncomingRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Which parts of the request go into the fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum KeyGenerationStrategy {
    /// Path only; the query string is ignored
    #[default]
    Path,

    /// Path plus every query parameter
    WithQuery,

    /// Path plus only the named query parameters
    WithSelectedQuery { params: Vec<String> },
}

impl KeyGenerationStrategy {
    /// Fingerprint a request into a 64 character hex token
    pub fn fingerprint(&self, request: &IncomingRequest) -> String {
        self.fingerprint_parts(request.path(), request.query())
    }

    /// Fingerprint a raw path and query
    pub fn fingerprint_parts(&self, path: &str, query: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_path(path).as_bytes());

        let query = match self {
            KeyGenerationStrategy::Path => None,
            KeyGenerationStrategy::WithQuery => query.map(|q| canonical_query(q, None)),
            KeyGenerationStrategy::WithSelectedQuery { params } => {
                query.map(|q| canonical_query(q, Some(params)))
            }
        };

        if let Some(query) = query.filter(|q| !q.is_empty()) {
            hasher.update(b"?");
            hasher.update(query.as_bytes());
        }

        hex::encode(hasher.finalize())
    }
}

/// Collapse duplicate slashes and resolve `.` and `..` segments
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    normalized.push_str(&segments.join("/"));

    // Keep a meaningful trailing slash: "/users/" and "/users" are different resources
    if path.ends_with('/') && !segments.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Decode, filter, sort and re-encode a query string.
///
/// Works on a copy; the request itself is left untouched.
fn canonical_query(query: &str, allow_list: Option<&Vec<String>>) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| match allow_list {
            Some(allowed) => allowed.iter().any(|a| a == name.as_ref()),
            None => true,
        })
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish()
}
