//! Core request-specification types for the scanner.
//!
//! - [`TargetUrl`]: raw-preserving parse of the user's target. The request
//!   path is never normalized; `..`, `//`, stray `%` escapes, and raw
//!   non-ASCII bytes all survive bit-for-bit.
//! - [`BypassPayload`]: one fully specified HTTP request to attempt.
//! - [`PayloadToken`]: reversible URL-safe base64 encoding of a payload,
//!   carried through results for correlation and `-resend`.
//! - [`Fingerprint`]: hash identity of a payload's wire bytes, used by the
//!   per-module and cross-module dedup layers.

mod token;
mod url;

pub use token::{PayloadToken, TokenError};
pub use url::{Scheme, TargetUrl, UrlError};

use serde::{Deserialize, Serialize};

/// One ordered request header. Duplicates are permitted and name casing is
/// preserved on the wire exactly as stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A fully specified request to send: the unit of work flowing from the
/// payload generators through the worker pool to the raw client.
///
/// Invariant: emitting this to the wire produces exactly
/// `{method} {raw_uri} HTTP/1.1\r\nHost: {host}\r\n{headers...}` with no
/// further mutation; anything not listed in `headers` is a client default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassPayload {
    pub method: String,
    pub scheme: Scheme,
    /// Value of the `Host` header, sent verbatim.
    pub host: String,
    pub raw_uri: String,
    pub headers: Vec<Header>,
    /// TCP/TLS destination (`host` or `host:port`) when it differs from the
    /// `Host` header — host-substitution payloads connect here while the
    /// wire bytes still claim `host`. `None` dials `host` itself.
    pub connect_to: Option<String>,
    /// Name of the module that produced this payload.
    pub bypass_module: String,
    /// Reversible token; see [`PayloadToken`]. Filled by [`Self::seal`].
    pub payload_token: String,
    /// The target as the user supplied it, for logging and correlation only.
    pub original_url: String,
}

impl BypassPayload {
    /// Start a payload from a parsed target: GET, no extra headers.
    pub fn from_target(module: &str, target: &TargetUrl) -> Self {
        Self {
            method: "GET".to_string(),
            scheme: target.scheme,
            host: target.host.clone(),
            raw_uri: target.raw_uri.clone(),
            headers: Vec::new(),
            connect_to: None,
            bypass_module: module.to_string(),
            payload_token: String::new(),
            original_url: target.full_url(),
        }
    }

    /// Compute and store the reversible token. Generators call this last,
    /// after every field that feeds the encoding is final.
    pub fn seal(mut self) -> Self {
        self.payload_token = PayloadToken::encode(&self);
        self
    }

    /// Hash identity of the wire bytes this payload will produce.
    ///
    /// Headers are sorted for hashing only, so two payloads that differ in
    /// header *order* (but not content) count as the same request. The
    /// payloads themselves still go out with their stated order.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.scheme.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.host.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.raw_uri.as_bytes());
        hasher.update(b"\0");
        if let Some(connect) = &self.connect_to {
            hasher.update(connect.as_bytes());
        }
        hasher.update(b"\0");

        let mut sorted: Vec<&Header> = self.headers.iter().collect();
        sorted.sort_by(|a, b| (&a.name, &a.value).cmp(&(&b.name, &b.value)));
        for h in sorted {
            hasher.update(h.name.as_bytes());
            hasher.update(b":");
            hasher.update(h.value.as_bytes());
            hasher.update(b"\n");
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }
}

/// Dedup key for a payload; see [`BypassPayload::fingerprint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);
