//! Credential holder — the in-memory auth token and its decoded identity.
//!
//! DESIGN
//! ======
//! The token is an opaque JWT issued by the record store. We never verify
//! its signature here (the store does that on every call); we only decode
//! the `exp` claim so expiry can be checked locally before a request is
//! made. A credential is valid only when the token decodes, is not within
//! `EXPIRY_THRESHOLD_SECS` of expiring, and carries an identity record.
//!
//! The same exported `CredentialBlob` is written to the cookie and to the
//! durable store, so both sides parse it through `parse_blob`.

use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::Record;

/// Tokens expiring within this many seconds are already treated as expired.
pub const EXPIRY_THRESHOLD_SECS: i64 = 5;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential blob is empty")]
    Empty,
    #[error("credential blob parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("token is malformed")]
    MalformedToken,
    #[error("token expired at {0}")]
    Expired(i64),
    #[error("credential carries no identity record")]
    MissingIdentity,
}

// =============================================================================
// BLOB
// =============================================================================

/// Exported credential shared by the cookie and the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialBlob {
    pub token: String,
    #[serde(default, alias = "model")]
    pub record: Option<Record>,
}

impl CredentialBlob {
    /// Serialize to the JSON form stored in both persistence adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the record contains values JSON cannot represent.
    pub fn to_json(&self) -> Result<String, CredentialError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse a persisted credential.
///
/// Accepts plain JSON, percent-encoded JSON (cookies written by other
/// clients), and a JSON string wrapping either form (older durable entries
/// stored the cookie export double-serialized).
///
/// # Errors
///
/// Returns `Empty` for blank input and `Parse` when no form decodes.
pub fn parse_blob(raw: &str) -> Result<CredentialBlob, CredentialError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CredentialError::Empty);
    }

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::String(inner)) => return parse_blob(&inner),
        Ok(value) => return Ok(serde_json::from_value(value)?),
        Err(e) if !raw.starts_with('%') => return Err(e.into()),
        Err(_) => {}
    }

    let decoded = urlencoding::decode(raw).map_err(|_| CredentialError::MalformedToken)?;
    Ok(serde_json::from_str(&decoded)?)
}

// =============================================================================
// TOKEN CLAIMS
// =============================================================================

/// Current unix time in seconds.
#[must_use]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Decode the `exp` claim of a JWT without verifying its signature.
///
/// # Errors
///
/// Returns `MalformedToken` if the token is not three dot-separated
/// segments, the payload is not base64url JSON, or `exp` is missing.
pub fn token_expiry(token: &str) -> Result<i64, CredentialError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CredentialError::MalformedToken);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| CredentialError::MalformedToken)?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).map_err(|_| CredentialError::MalformedToken)?;

    #[allow(clippy::cast_possible_truncation)]
    claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)))
        .ok_or(CredentialError::MalformedToken)
}

/// Check a blob and turn it into a live auth store.
///
/// # Errors
///
/// Returns the first reason the credential cannot be trusted.
pub fn validate_blob(blob: CredentialBlob, now: i64) -> Result<AuthStore, CredentialError> {
    let exp = token_expiry(&blob.token)?;
    if exp - EXPIRY_THRESHOLD_SECS <= now {
        return Err(CredentialError::Expired(exp));
    }
    if blob.record.is_none() {
        return Err(CredentialError::MissingIdentity);
    }
    Ok(AuthStore { token: blob.token, record: blob.record })
}

// =============================================================================
// AUTH STORE
// =============================================================================

/// Token plus identity. Validity is computed on every read, never cached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthStore {
    token: String,
    record: Option<Record>,
}

impl AuthStore {
    #[must_use]
    pub fn new(token: impl Into<String>, record: Option<Record>) -> Self {
        Self { token: token.into(), record }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_unix())
    }

    #[must_use]
    pub fn is_valid_at(&self, now: i64) -> bool {
        if self.token.is_empty() || self.record.is_none() {
            return false;
        }
        token_expiry(&self.token).is_ok_and(|exp| exp - EXPIRY_THRESHOLD_SECS > now)
    }

    /// The raw token, if one is held (valid or not).
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        (!self.token.is_empty()).then_some(self.token.as_str())
    }

    /// The identity, present only while the token is valid.
    #[must_use]
    pub fn record(&self) -> Option<&Record> {
        if self.is_valid() { self.record.as_ref() } else { None }
    }

    pub fn save(&mut self, token: impl Into<String>, record: Option<Record>) {
        self.token = token.into();
        self.record = record;
    }

    pub fn clear(&mut self) {
        self.token.clear();
        self.record = None;
    }

    #[must_use]
    pub fn export(&self) -> CredentialBlob {
        CredentialBlob { token: self.token.clone(), record: self.record.clone() }
    }
}

// =============================================================================
// SHARED HOLDER
// =============================================================================

/// Cloneable handle to one `AuthStore`. Clones share the same credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialHolder {
    inner: Arc<RwLock<AuthStore>>,
}

impl CredentialHolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> AuthStore {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_valid()
    }

    /// The token, only if it is currently valid.
    #[must_use]
    pub fn valid_token(&self) -> Option<String> {
        let auth = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        auth.is_valid().then(|| auth.token.clone())
    }

    #[must_use]
    pub fn record(&self) -> Option<Record> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .record()
            .cloned()
    }

    pub fn save(&self, token: impl Into<String>, record: Option<Record>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .save(token, record);
    }

    pub fn replace(&self, auth: AuthStore) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = auth;
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
#[path = "credential_test.rs"]
mod tests;
