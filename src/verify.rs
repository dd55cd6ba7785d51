//! Verification adapter: the boundary between key resolution and the
//! token-verification primitive.
//!
//! Verification libraries ask for keys through a narrow callback: given
//! the kid and algorithm a token declares, hand back the key to verify
//! with, or an error that surfaces as "invalid token". This module wraps
//! [`KeyResolver`] behind that shape and enforces the algorithm-family
//! check on the way out: a token must never be verified with a key of an
//! incompatible type.
//!
//! The adapter is synchronous from the verifier's perspective. A call may
//! block for the duration of one JWKS refresh (cache miss on a rotated
//! key); callers apply their own timeout budget on top.

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use thiserror::Error;

use crate::jwks::cache::KeyCache;
use crate::jwks::resolve::{KeyResolver, ResolveError};
use crate::jwks::snapshot::{Key, KeyFamily};

#[derive(Debug, Error)]
pub enum KeyLookupError {
    #[error("Algorithm mismatch for key {kid}: token declares {token_alg:?}, key family is {family}")]
    AlgorithmMismatch {
        kid: String,
        token_alg: Algorithm,
        family: KeyFamily,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Failed to decode token header: {0}")]
    InvalidHeader(String),

    #[error("Token header missing key ID (kid)")]
    MissingKeyId,

    #[error(transparent)]
    KeyLookup(#[from] KeyLookupError),

    #[error("Token rejected: {0}")]
    InvalidToken(String),
}

/// Key lookup function shape expected by callback-style verifiers.
pub type KeyFn =
    Box<dyn Fn(&str, Algorithm) -> Result<Arc<Key>, KeyLookupError> + Send + Sync>;

/// Serves verification keys for tokens issued against one JWKS source.
pub struct VerificationKeys {
    resolver: KeyResolver,
    source_url: String,
}

impl VerificationKeys {
    pub fn new(cache: Arc<KeyCache>, source_url: impl Into<String>) -> Self {
        Self {
            resolver: KeyResolver::new(cache),
            source_url: source_url.into(),
        }
    }

    /// The key to verify a token with, given the kid and algorithm its
    /// header declares.
    ///
    /// Rejects keys whose family does not match the declared algorithm.
    /// HMAC algorithms always mismatch: a public key set cannot back a
    /// symmetric signature.
    pub fn key_for(&self, kid: &str, token_alg: Algorithm) -> Result<Arc<Key>, KeyLookupError> {
        let key = self.resolver.resolve(&self.source_url, kid)?;

        match KeyFamily::of_algorithm(token_alg) {
            Some(family) if family == key.family() => Ok(key),
            _ => Err(KeyLookupError::AlgorithmMismatch {
                kid: kid.to_string(),
                token_alg,
                family: key.family(),
            }),
        }
    }

    /// A boxed closure over [`VerificationKeys::key_for`], for verifiers
    /// that take the lookup as a plain function.
    pub fn key_fn(self: &Arc<Self>) -> KeyFn {
        let keys = Arc::clone(self);
        Box::new(move |kid, alg| keys.key_for(kid, alg))
    }

    /// Verify a token end to end and return its raw claims.
    ///
    /// Decodes the header, resolves the verification key, and hands both
    /// to the verification primitive. Audience and claim-schema checks
    /// are the embedding service's business and are not performed here.
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, VerifyError> {
        let header =
            decode_header(token).map_err(|e| VerifyError::InvalidHeader(e.to_string()))?;
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;

        let key = self.key_for(&kid, header.alg)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;

        let data = decode::<serde_json::Value>(token, key.decoding_key(), &validation)
            .map_err(|e| VerifyError::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }

    /// URL of the JWKS source this adapter resolves against.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}
