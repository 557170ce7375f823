//! Shared recon cache: DNS + port/scheme discovery per host.
//!
//! Host-substitution payloads need to know which addresses actually answer
//! for a host and on which scheme/port. [`ReconCache::process_host`] runs
//! the full pipeline on first sight of a host — racing resolvers, probing
//! ports — and every later caller reads the cached [`ReconResult`]. The
//! cache is bounded (LRU) and warms on demand, so a single-URL run pays for
//! exactly one host.

mod probe;
mod resolve;

use dashmap::DashMap;
use gatecrash_common::ReconConfig;
use lru::LruCache;
use probe::PortScheme;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("resolution failed: {0}")]
    Resolve(String),
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    #[error("recon setup failed: {0}")]
    Setup(String),
}

/// Discovery output for one host. Service maps are keyed scheme → address →
/// open ports; BTree containers keep iteration (and payload order) stable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconResult {
    pub host: String,
    pub cnames: BTreeSet<String>,
    pub ipv4_services: BTreeMap<String, BTreeMap<Ipv4Addr, BTreeSet<u16>>>,
    pub ipv6_services: BTreeMap<String, BTreeMap<Ipv6Addr, BTreeSet<u16>>>,
}

impl ReconResult {
    fn add_service(&mut self, scheme: &str, ip: IpAddr, port: u16) {
        match ip {
            IpAddr::V4(v4) => {
                self.ipv4_services
                    .entry(scheme.to_string())
                    .or_default()
                    .entry(v4)
                    .or_default()
                    .insert(port);
            }
            IpAddr::V6(v6) => {
                self.ipv6_services
                    .entry(scheme.to_string())
                    .or_default()
                    .entry(v6)
                    .or_default()
                    .insert(port);
            }
        }
    }

    /// Every address with at least one open service, sorted and deduplicated.
    pub fn all_ips(&self) -> Vec<IpAddr> {
        let mut out: BTreeSet<IpAddr> = BTreeSet::new();
        for per_ip in self.ipv4_services.values() {
            out.extend(per_ip.keys().map(|ip| IpAddr::V4(*ip)));
        }
        for per_ip in self.ipv6_services.values() {
            out.extend(per_ip.keys().map(|ip| IpAddr::V6(*ip)));
        }
        out.into_iter().collect()
    }

    pub fn has_services(&self) -> bool {
        !self.ipv4_services.is_empty() || !self.ipv6_services.is_empty()
    }
}

/// Bounded, shared host-discovery cache. Readers hit the LRU concurrently;
/// at most one probe pipeline runs per host at a time.
pub struct ReconCache {
    cfg: ReconConfig,
    tls: Arc<tokio_rustls::rustls::ClientConfig>,
    doh: reqwest::Client,
    cache: Mutex<LruCache<String, Arc<ReconResult>>>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ReconCache {
    pub fn new(cfg: ReconConfig) -> Result<Self, ReconError> {
        let capacity = NonZeroUsize::new(cfg.cache_capacity.max(1)).expect("nonzero capacity");
        let tls = gatecrash_http::tls::client_config(&gatecrash_common::ClientConfig::default())
            .map_err(|e| ReconError::Setup(e.to_string()))?;
        let doh = reqwest::Client::builder()
            .timeout(cfg.resolve_timeout)
            .build()
            .map_err(|e| ReconError::Setup(e.to_string()))?;
        Ok(Self {
            cfg,
            tls,
            doh,
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: DashMap::new(),
        })
    }

    /// Cached result, if the host was already processed. Promotes the entry.
    pub fn get(&self, host: &str) -> Option<Arc<ReconResult>> {
        self.cache.lock().expect("recon cache lock").get(host).cloned()
    }

    /// Resolve + probe `input` (`host` or `host:port`), reusing the cache.
    pub async fn process_host(&self, input: &str) -> Result<Arc<ReconResult>, ReconError> {
        let (host, custom_port) = split_input(input);

        if let Some(hit) = self.get(&host) {
            return Ok(hit);
        }

        // Single writer per host; losers of the race wait then read.
        let gate = self
            .in_flight
            .entry(host.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;
        if let Some(hit) = self.get(&host) {
            return Ok(hit);
        }

        tracing::info!(host, "recon.process.start");
        let result = self.discover(&host, custom_port).await?;
        let shared = Arc::new(result);
        self.cache
            .lock()
            .expect("recon cache lock")
            .put(host.clone(), shared.clone());
        self.in_flight.remove(&host);
        tracing::info!(
            host,
            ips = shared.all_ips().len(),
            cnames = shared.cnames.len(),
            "recon.process.done"
        );
        Ok(shared)
    }

    async fn discover(&self, host: &str, custom_port: Option<u16>) -> Result<ReconResult, ReconError> {
        let (addrs, cnames) = if let Ok(literal) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            (BTreeSet::from([literal]), BTreeSet::new())
        } else {
            let resolved = resolve::resolve_racing(host, &self.cfg, &self.doh).await?;
            (resolved.addrs, resolved.cnames)
        };

        let mut ports: BTreeSet<u16> = BTreeSet::from([80, 443]);
        ports.extend(custom_port);

        let mut probes: JoinSet<(IpAddr, u16, Option<PortScheme>)> = JoinSet::new();
        for ip in &addrs {
            for port in &ports {
                let (ip, port) = (*ip, *port);
                let host = host.to_string();
                let tls = self.tls.clone();
                let budget = self.cfg.probe_timeout;
                probes.spawn(async move {
                    let scheme = probe::probe_port(&host, ip, port, budget, &tls).await;
                    (ip, port, scheme)
                });
            }
        }

        let mut result = ReconResult {
            host: host.to_string(),
            cnames,
            ..Default::default()
        };
        while let Some(joined) = probes.join_next().await {
            if let Ok((ip, port, Some(scheme))) = joined {
                result.add_service(scheme.as_str(), ip, port);
            }
        }
        Ok(result)
    }
}

/// `host[:port]` → (host, explicit port); IPv6 brackets respected.
fn split_input(input: &str) -> (String, Option<u16>) {
    if let Some(rest) = input.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = format!("[{}]", &rest[..end]);
            let port = rest[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match input.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) && !p.is_empty() => {
            (h.to_string(), p.parse().ok())
        }
        _ => (input.to_string(), None),
    }
}
