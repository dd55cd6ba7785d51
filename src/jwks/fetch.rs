//! JWKS document fetching and parsing.
//!
//! This module handles:
//! - HTTP retrieval of a JWKS document with a bounded timeout
//! - Parsing key entries (RSA, EC, OKP) into verification keys
//! - Extracting refresh hints from `Cache-Control`/`Expires` headers
//!
//! The fetcher never touches shared state; it returns a fully built
//! snapshot for the caller to install.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use thiserror::Error;

use crate::jwks::snapshot::{Key, KeyFamily, KeySetSnapshot};

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Failed to fetch JWKS from {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("No usable keys in JWKS from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// Refresh hints extracted from a fetch's response headers.
///
/// `ttl` is how long the server suggests the document stays fresh.
/// `None` means the response carried no usable hint and the scheduler
/// falls back to its configured floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheHints {
    pub ttl: Option<Duration>,
}

/// Retrieves and parses a key set from a source URL.
///
/// The trait seam exists so the cache can be driven by fake fetchers in
/// tests; production code uses [`HttpFetcher`].
pub trait KeySetFetcher: Send + Sync {
    fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError>;
}

/// Fetches JWKS documents over HTTP with a bounded per-request timeout.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl KeySetFetcher for HttpFetcher {
    fn fetch(&self, source_url: &str) -> Result<(KeySetSnapshot, CacheHints), FetchError> {
        tracing::debug!(url = %source_url, "Fetching JWKS");

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: source_url.to_string(),
                reason: e.to_string(),
            })?;

        let response = client
            .get(source_url)
            .send()
            .map_err(|e| FetchError::Network {
                url: source_url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Network {
                url: source_url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let hints = hints_from_headers(
            header_str(&response, reqwest::header::CACHE_CONTROL),
            header_str(&response, reqwest::header::EXPIRES),
            Utc::now(),
        );

        let body = response.bytes().map_err(|e| FetchError::Network {
            url: source_url.to_string(),
            reason: e.to_string(),
        })?;

        let snapshot = parse_key_set(source_url, &body, SystemTime::now())?;
        Ok((snapshot, hints))
    }
}

fn header_str<'a>(
    response: &'a reqwest::blocking::Response,
    name: reqwest::header::HeaderName,
) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// JWKS wire document: a sequence of key objects.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: String,
    #[serde(rename = "use")]
    key_use: Option<String>,
    // RSA components
    n: Option<String>,
    e: Option<String>,
    // EC / OKP components
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Parse a JWKS document body into a snapshot.
///
/// Malformed entries are skipped with a warning; a document yielding zero
/// usable keys is a hard failure.
pub(crate) fn parse_key_set(
    source_url: &str,
    body: &[u8],
    fetched_at: SystemTime,
) -> Result<KeySetSnapshot, FetchError> {
    let document: JwksDocument =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse {
            url: source_url.to_string(),
            reason: e.to_string(),
        })?;

    let mut keys = Vec::new();
    for entry in &document.keys {
        match parse_entry(entry) {
            Ok(key) => keys.push(key),
            Err(reason) => {
                tracing::warn!(
                    url = %source_url,
                    kid = entry.kid.as_deref().unwrap_or("<none>"),
                    %reason,
                    "Skipping unusable JWKS entry"
                );
            }
        }
    }

    if keys.is_empty() {
        return Err(FetchError::Parse {
            url: source_url.to_string(),
            reason: "document contains no usable keys".to_string(),
        });
    }

    Ok(KeySetSnapshot::new(
        source_url.to_string(),
        fetched_at,
        keys,
    ))
}

fn parse_entry(entry: &JwkEntry) -> Result<Key, String> {
    if let Some(key_use) = &entry.key_use {
        if key_use != "sig" {
            return Err(format!("key use is '{}', not 'sig'", key_use));
        }
    }

    let kid = entry
        .kid
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or("missing kid")?;

    let (family, decoding_key) = match entry.kty.as_str() {
        "RSA" => {
            let n = entry.n.as_deref().ok_or("RSA key missing 'n'")?;
            let e = entry.e.as_deref().ok_or("RSA key missing 'e'")?;
            let key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| format!("invalid RSA components: {}", e))?;
            (KeyFamily::Rsa, key)
        }
        "EC" => {
            let crv = entry.crv.as_deref().ok_or("EC key missing 'crv'")?;
            if !matches!(crv, "P-256" | "P-384") {
                return Err(format!("unsupported EC curve '{}'", crv));
            }
            let x = entry.x.as_deref().ok_or("EC key missing 'x'")?;
            let y = entry.y.as_deref().ok_or("EC key missing 'y'")?;
            let key = DecodingKey::from_ec_components(x, y)
                .map_err(|e| format!("invalid EC components: {}", e))?;
            (KeyFamily::Ec, key)
        }
        "OKP" => {
            let crv = entry.crv.as_deref().ok_or("OKP key missing 'crv'")?;
            if crv != "Ed25519" {
                return Err(format!("unsupported OKP curve '{}'", crv));
            }
            let x = entry.x.as_deref().ok_or("OKP key missing 'x'")?;
            let key = DecodingKey::from_ed_components(x)
                .map_err(|e| format!("invalid OKP component: {}", e))?;
            (KeyFamily::Ed, key)
        }
        other => return Err(format!("unsupported key type '{}'", other)),
    };

    Ok(Key::new(kid.to_string(), family, decoding_key))
}

/// Compute refresh hints from response headers.
///
/// `Cache-Control: max-age` takes precedence over `Expires`; an `Expires`
/// already in the past yields a zero TTL (the scheduler's floor still
/// applies). Absence of both yields no hint.
pub(crate) fn hints_from_headers(
    cache_control: Option<&str>,
    expires: Option<&str>,
    now: DateTime<Utc>,
) -> CacheHints {
    if let Some(value) = cache_control {
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(secs) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = secs.parse::<u64>() {
                    return CacheHints {
                        ttl: Some(Duration::from_secs(secs)),
                    };
                }
            }
        }
    }

    if let Some(value) = expires {
        if let Ok(at) = DateTime::parse_from_rfc2822(value) {
            let ttl = (at.with_timezone(&Utc) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            return CacheHints { ttl: Some(ttl) };
        }
    }

    CacheHints::default()
}
