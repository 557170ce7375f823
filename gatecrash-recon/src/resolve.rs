//! DNS resolution as a race.
//!
//! One host lookup fans out to the system resolver, every configured UDP
//! server, and a DoH JSON endpoint. The first positive answer starts a
//! short grace window so slower resolvers can still contribute to the
//! union; the whole race is bounded by the configured resolve budget.

use gatecrash_common::ReconConfig;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioResolver;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::ReconError;

const RACE_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Default, Clone)]
pub(crate) struct Resolved {
    pub addrs: BTreeSet<IpAddr>,
    pub cnames: BTreeSet<String>,
}

impl Resolved {
    fn merge(&mut self, other: Resolved) {
        self.addrs.extend(other.addrs);
        self.cnames.extend(other.cnames);
    }
}

pub(crate) async fn resolve_racing(
    host: &str,
    cfg: &ReconConfig,
    doh: &reqwest::Client,
) -> Result<Resolved, ReconError> {
    let mut set: JoinSet<Resolved> = JoinSet::new();

    {
        let host = host.to_string();
        set.spawn(async move { system_lookup(&host).await.unwrap_or_default() });
    }

    for server in &cfg.dns_servers {
        let host = host.to_string();
        let server = server.clone();
        set.spawn(async move { udp_lookup(&host, &server).await.unwrap_or_default() });
    }

    {
        let host = host.to_string();
        let doh = doh.clone();
        let endpoint = cfg.doh_endpoint.clone();
        set.spawn(async move { doh_lookup(&host, &endpoint, &doh).await.unwrap_or_default() });
    }

    let mut union = Resolved::default();
    let race = async {
        // Phase one: wait for the first non-empty answer.
        while let Some(joined) = set.join_next().await {
            if let Ok(part) = joined {
                let positive = !part.addrs.is_empty();
                union.merge(part);
                if positive {
                    break;
                }
            }
        }
        // Phase two: give the stragglers a moment, then stop waiting.
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok(part)) => union.merge(part),
                    Some(Err(_)) => {}
                    None => break,
                },
                _ = sleep(RACE_GRACE) => break,
            }
        }
    };

    if timeout(cfg.resolve_timeout, race).await.is_err() {
        tracing::debug!(host, "recon.resolve.budget_exhausted");
    }
    set.abort_all();

    if union.addrs.is_empty() {
        return Err(ReconError::NoAddresses(host.to_string()));
    }
    Ok(union)
}

async fn system_lookup(host: &str) -> Result<Resolved, ReconError> {
    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| ReconError::Resolve(e.to_string()))?
        .build();
    lookup_with(&resolver, host).await
}

async fn udp_lookup(host: &str, server: &str) -> Result<Resolved, ReconError> {
    let (ip, port) = match server.rsplit_once(':') {
        Some((ip, port)) => (
            ip.parse::<IpAddr>()
                .map_err(|e| ReconError::Resolve(format!("bad DNS server {server:?}: {e}")))?,
            port.parse::<u16>()
                .map_err(|e| ReconError::Resolve(format!("bad DNS port {server:?}: {e}")))?,
        ),
        None => (
            server
                .parse::<IpAddr>()
                .map_err(|e| ReconError::Resolve(format!("bad DNS server {server:?}: {e}")))?,
            53,
        ),
    };
    let group = NameServerConfigGroup::from_ips_clear(&[ip], port, true);
    let config = ResolverConfig::from_parts(None, vec![], group);
    let resolver =
        TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();
    lookup_with(&resolver, host).await
}

async fn lookup_with(resolver: &TokioResolver, host: &str) -> Result<Resolved, ReconError> {
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| ReconError::Resolve(e.to_string()))?;

    let mut out = Resolved::default();
    for record in lookup.as_lookup().record_iter() {
        if record.record_type() == RecordType::CNAME {
            if let Some(cname) = record.data().as_cname() {
                out.cnames.insert(cname.0.to_utf8().trim_end_matches('.').to_string());
            }
        }
    }
    out.addrs.extend(lookup.iter());
    Ok(out)
}

// ==============================
// DNS-over-HTTPS (JSON API)
// ==============================

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(default, rename = "Answer")]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    data: String,
}

const RR_A: u16 = 1;
const RR_CNAME: u16 = 5;
const RR_AAAA: u16 = 28;

async fn doh_lookup(
    host: &str,
    endpoint: &str,
    client: &reqwest::Client,
) -> Result<Resolved, ReconError> {
    let mut out = Resolved::default();
    for rr in ["A", "AAAA"] {
        let resp = client
            .get(endpoint)
            .query(&[("name", host), ("type", rr)])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| ReconError::Resolve(e.to_string()))?
            .json::<DohResponse>()
            .await
            .map_err(|e| ReconError::Resolve(e.to_string()))?;

        for answer in resp.answer {
            match answer.rr_type {
                RR_A | RR_AAAA => {
                    if let Ok(ip) = answer.data.parse::<IpAddr>() {
                        out.addrs.insert(ip);
                    }
                }
                RR_CNAME => {
                    out.cnames
                        .insert(answer.data.trim_end_matches('.').to_string());
                }
                _ => {}
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doh_answer_shape_parses() {
        let json = r#"{"Status":0,"Answer":[
            {"name":"example.com","type":5,"TTL":300,"data":"edge.example.net."},
            {"name":"edge.example.net","type":1,"TTL":300,"data":"203.0.113.7"}
        ]}"#;
        let parsed: DohResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.answer.len(), 2);
        assert_eq!(parsed.answer[0].rr_type, RR_CNAME);
        assert_eq!(parsed.answer[1].data, "203.0.113.7");
    }

    #[test]
    fn doh_missing_answer_is_empty() {
        let parsed: DohResponse = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert!(parsed.answer.is_empty());
    }
}
