//! Immutable key-set snapshots.
//!
//! A snapshot is a point-in-time view of one source's key set: a mapping
//! from key ID (kid) to parsed public key material. Snapshots are never
//! mutated; a refresh builds a new snapshot and installs it atomically.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use jsonwebtoken::{Algorithm, DecodingKey};

/// Algorithm family of a verification key.
///
/// Used to reject tokens whose declared algorithm does not match the key
/// type they name (algorithm-confusion defense).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// RSA keys (RS256/RS384/RS512, PS256/PS384/PS512)
    Rsa,
    /// Elliptic-curve keys (ES256/ES384)
    Ec,
    /// Edwards-curve keys (EdDSA)
    Ed,
}

impl KeyFamily {
    /// Family implied by a token's declared signing algorithm.
    ///
    /// Returns `None` for HMAC algorithms: symmetric keys are never
    /// published in a JWKS, so no key in a snapshot can legitimately
    /// verify an HS* token.
    pub fn of_algorithm(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Some(KeyFamily::Rsa),
            Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
            Algorithm::EdDSA => Some(KeyFamily::Ed),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => None,
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFamily::Rsa => write!(f, "RSA"),
            KeyFamily::Ec => write!(f, "EC"),
            KeyFamily::Ed => write!(f, "Ed"),
        }
    }
}

/// A single parsed verification key. Immutable once parsed.
pub struct Key {
    kid: String,
    family: KeyFamily,
    decoding_key: DecodingKey,
}

impl Key {
    pub fn new(kid: String, family: KeyFamily, decoding_key: DecodingKey) -> Self {
        Self {
            kid,
            family,
            decoding_key,
        }
    }

    /// The key ID (kid) this key is published under.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// Algorithm family of the key material.
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// The parsed key material, ready for the verification primitive.
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

// DecodingKey is opaque; print only what identifies the key.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .finish()
    }
}

/// An immutable kid -> key mapping from one fetch of a source.
#[derive(Debug)]
pub struct KeySetSnapshot {
    source_url: String,
    fetched_at: SystemTime,
    keys: HashMap<String, Arc<Key>>,
}

impl KeySetSnapshot {
    /// Build a snapshot from parsed keys.
    ///
    /// Duplicate kids within one document resolve last-one-wins.
    pub fn new(
        source_url: String,
        fetched_at: SystemTime,
        keys: impl IntoIterator<Item = Key>,
    ) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| (k.kid.clone(), Arc::new(k)))
            .collect();
        Self {
            source_url,
            fetched_at,
            keys,
        }
    }

    /// Look up a key by kid.
    pub fn key(&self, kid: &str) -> Option<Arc<Key>> {
        self.keys.get(kid).cloned()
    }

    /// All kids present in this snapshot, in no particular order.
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Number of keys in this snapshot.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// URL of the source this snapshot was fetched from.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// When this snapshot was fetched.
    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }
}
