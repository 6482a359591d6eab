/// Authentication utilities for shared-secret validation
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

/// The header callers put the shared secret in.
pub const API_KEY_HEADER: &str = "aff-api-key";

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl ConstantTimeString {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compares against raw bytes without allocating.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        self.0.as_bytes().ct_eq(candidate).into()
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.0.as_bytes())
    }
}

impl Eq for ConstantTimeString {}

/// Secrets never show up in logs.
impl fmt::Debug for ConstantTimeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConstantTimeString(<redacted>)")
    }
}

/// Validates the `aff-api-key` header against the configured secret.
///
/// A missing or empty header, a header that isn't valid visible ASCII, and a wrong value are all
/// treated the same way.
pub fn validate_api_key(secret: &ConstantTimeString, headers: &HeaderMap) -> bool {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(candidate) if !candidate.is_empty() => secret.matches(candidate.as_bytes()),
        _ => false,
    }
}
