//! Raw-preserving target URL model.
//!
//! The standard `url` crate normalizes aggressively (percent-recoding, dot
//! segment removal, case folding) — exactly what this scanner must never do.
//! This parser scans only far enough to identify the scheme and host;
//! everything from the first `/` (or `?`) onward is stored verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("missing scheme in {0:?} (expected http:// or https://)")]
    MissingScheme(String),
    #[error("unsupported scheme {0:?} (only http and https)")]
    UnsupportedScheme(String),
    #[error("missing host in {0:?}")]
    MissingHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scanner's input: scheme, authority, and the untouched request target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetUrl {
    pub scheme: Scheme,
    /// Authority including any `:port` suffix, exactly as supplied.
    pub host: String,
    /// Everything from the first `/` (or `?`) to end of input, exactly as
    /// supplied. May be empty.
    pub raw_uri: String,
    /// Suffix after the first `?` inside `raw_uri`, kept separately for
    /// modules that must re-append it.
    pub original_query: Option<String>,
}

impl TargetUrl {
    /// Parse a target. Only three inputs are rejected: missing scheme,
    /// missing host, and a scheme other than http/https. Anything after the
    /// authority — `..`, `//`, `%2e%2e`, `;params`, raw UTF-8 — is kept as-is.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let (scheme, rest) = match input.split_once("://") {
            Some((s, rest)) => (s, rest),
            None => return Err(UrlError::MissingScheme(input.to_string())),
        };

        let scheme = match () {
            _ if scheme.eq_ignore_ascii_case("http") => Scheme::Http,
            _ if scheme.eq_ignore_ascii_case("https") => Scheme::Https,
            _ => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
        };

        // The authority ends at the first `/` or `?`; a query with no path
        // (`http://h?x=1`) still belongs to the raw URI, not the host.
        let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
        let (host, raw_uri) = rest.split_at(split_at);
        if host.is_empty() {
            return Err(UrlError::MissingHost(input.to_string()));
        }

        let original_query = raw_uri
            .split_once('?')
            .map(|(_, q)| q.to_string());

        Ok(Self {
            scheme,
            host: host.to_string(),
            raw_uri: raw_uri.to_string(),
            original_query,
        })
    }

    /// `scheme://host`, no trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// The input reproduced bit-for-bit: `scheme://host` + raw URI.
    pub fn full_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.raw_uri)
    }

    /// `raw_uri` with any query stripped; the portion path mutators operate on.
    pub fn path_portion(&self) -> &str {
        match self.raw_uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.raw_uri,
        }
    }

    /// Host with any `:port` suffix removed. IPv6 literals keep brackets.
    pub fn host_without_port(&self) -> &str {
        if self.host.starts_with('[') {
            match self.host.find(']') {
                Some(end) => &self.host[..=end],
                None => &self.host,
            }
        } else {
            match self.host.rsplit_once(':') {
                Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => h,
                _ => &self.host,
            }
        }
    }

    /// Explicit port from the authority, if present.
    pub fn port(&self) -> Option<u16> {
        let after = if self.host.starts_with('[') {
            self.host.find(']').map(|i| &self.host[i + 1..])?
        } else {
            &self.host
        };
        match after.rsplit_once(':') {
            Some((_, p)) => p.parse().ok(),
            None => None,
        }
    }

    /// Explicit port or the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.port().unwrap_or_else(|| self.scheme.default_port())
    }
}
