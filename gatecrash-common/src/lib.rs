//! Common types and utilities shared across gatecrash crates.
//!
//! This crate defines the resolved scan configuration, response filters,
//! observability helpers, and a handful of shared enums. It is intentionally
//! lightweight and dependency-minimal so that every crate in the workspace
//! can depend on it without heavy transitive costs.
//!
//! # Overview
//!
//! - [`ScanConfig`]: top-level runtime configuration for one scan run
//! - [`ClientConfig`]: raw HTTP client tuning (timeouts, proxy, TLS, preview)
//! - [`FilterConfig`]: which responses count as findings
//! - [`ReconConfig`]: DNS/probe settings for the recon cache
//! - [`observability`]: centralised tracing/logging initialisation
//!
//! # Examples
//!
//! Constructing a default configuration:
//!
//! ```rust
//! use gatecrash_common::ScanConfig;
//!
//! let cfg = ScanConfig::default();
//! assert_eq!(cfg.threads, 15);
//! assert_eq!(cfg.max_consecutive_failed_reqs, 5);
//! ```
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod observability;

/// Top-level configuration for one scan run.
///
/// Built by the CLI layer from flags and passed by reference into the
/// orchestrator; no global state is consulted anywhere below it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Number of concurrent request workers per module run.
    pub threads: usize,
    /// Fixed inter-request delay applied across all workers (global rate
    /// bound, not per-worker). Zero disables pacing.
    pub delay: Duration,
    /// Retry attempts after the initial request, for retryable failures only.
    pub max_retries: u32,
    /// Base backoff between retries; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,
    /// Consecutive per-host failures before the module halts for that host.
    pub max_consecutive_failed_reqs: u32,
    /// Window in which consecutive failures must occur to count.
    pub failure_window: Duration,
    /// Auto-throttle: grow the shared delay when the 429/503 share of a
    /// sliding window crosses this fraction.
    pub throttle_trigger_ratio: f64,
    /// Auto-throttle delay ceiling.
    pub throttle_max_delay: Duration,
    pub client: ClientConfig,
    pub filters: FilterConfig,
    pub recon: ReconConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: 15,
            delay: Duration::ZERO,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            max_consecutive_failed_reqs: 5,
            failure_window: Duration::from_secs(30),
            throttle_trigger_ratio: 0.2,
            throttle_max_delay: Duration::from_secs(5),
            client: ClientConfig::default(),
            filters: FilterConfig::default(),
            recon: ReconConfig::default(),
        }
    }
}

/// Raw HTTP client tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// TCP connect budget (also applies to the proxy dial).
    pub connect_timeout: Duration,
    /// Budget for send + response head + bounded body, after connect.
    pub request_timeout: Duration,
    /// Bytes of decoded response body retained as the preview. Zero keeps
    /// headers only.
    pub response_body_preview_size: usize,
    /// Stop reading the body the moment the preview cap is hit, sacrificing
    /// the connection. When `false` (default) the framed body is drained —
    /// up to a hard ceiling — so the connection stays poolable.
    pub stream_response_body: bool,
    /// Keep connections for reuse; `false` sends `Connection: close`.
    pub reuse_connections: bool,
    /// Idle seconds before a pooled connection is considered stale.
    pub pool_idle_timeout: Duration,
    /// Optional HTTP CONNECT proxy, e.g. `http://127.0.0.1:8080`.
    pub proxy: Option<String>,
    /// Override the SNI sent on TLS handshakes. Defaults to the connect host.
    pub sni: Option<String>,
    /// Restrict TLS cipher suites by name; empty means the library default.
    /// Reordering this list changes the handshake shape between runs.
    pub cipher_suites: Vec<String>,
    /// User-Agent sent when the payload does not carry its own.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(20),
            response_body_preview_size: 1024,
            stream_response_body: false,
            reuse_connections: true,
            pool_idle_timeout: Duration::from_secs(30),
            proxy: None,
            sni: None,
            cipher_suites: Vec::new(),
            user_agent: concat!("gatecrash/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Validate the proxy URL up front so a typo fails the run at startup
    /// instead of on the first dial.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(proxy) = &self.proxy {
            let parsed = url::Url::parse(proxy)
                .map_err(|e| anyhow::anyhow!("invalid proxy URL {proxy:?}: {e}"))?;
            if parsed.scheme() != "http" {
                anyhow::bail!("proxy scheme must be http (CONNECT), got {:?}", parsed.scheme());
            }
            if parsed.host_str().is_none() {
                anyhow::bail!("proxy URL {proxy:?} has no host");
            }
        }
        Ok(())
    }
}

/// Which responses survive into the result sink.
///
/// Status-code semantics are fixed: `None` accepts every code, an empty
/// list accepts none, a non-empty list accepts exactly its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub match_status_codes: Option<Vec<u16>>,
    /// Substring matches against the response `Content-Type`.
    pub match_content_types: Vec<String>,
    pub min_content_length: Option<u64>,
    pub max_content_length: Option<u64>,
}

impl FilterConfig {
    pub fn accepts_status(&self, code: u16) -> bool {
        match &self.match_status_codes {
            None => true,
            Some(codes) => codes.contains(&code),
        }
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        if self.match_content_types.is_empty() {
            return true;
        }
        self.match_content_types
            .iter()
            .any(|needle| content_type.contains(needle.as_str()))
    }

    pub fn accepts_content_length(&self, len: Option<u64>) -> bool {
        let Some(len) = len else {
            // No Content-Length header: only an explicit minimum can reject.
            return self.min_content_length.is_none();
        };
        if let Some(min) = self.min_content_length {
            if len < min {
                return false;
            }
        }
        if let Some(max) = self.max_content_length {
            if len > max {
                return false;
            }
        }
        true
    }
}

/// DNS + probe settings consumed by the recon cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconConfig {
    /// Extra UDP DNS servers raced against the system resolver, `ip:port`.
    pub dns_servers: Vec<String>,
    /// DNS-over-HTTPS JSON endpoint raced alongside UDP lookups.
    pub doh_endpoint: String,
    /// Overall budget for one host's resolution race.
    pub resolve_timeout: Duration,
    /// Per-port TLS/TCP probe budget.
    pub probe_timeout: Duration,
    /// Maximum hosts retained in the cache before LRU eviction.
    pub cache_capacity: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            dns_servers: vec!["1.1.1.1:53".into(), "8.8.8.8:53".into()],
            doh_endpoint: "https://cloudflare-dns.com/dns-query".into(),
            resolve_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            cache_capacity: 1000,
        }
    }
}
