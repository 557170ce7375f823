//! Bypass payload generators.
//!
//! Each module is a pure, lazy generator: given a parsed target and the
//! resolved tables it yields a deterministic sequence of [`BypassPayload`]s.
//! Modules share no state; the only outside input is the recon snapshot the
//! orchestrator passes in for host substitution. Every module's output runs
//! through a fingerprint dedup adapter, so within one module a given wire
//! request is emitted at most once (dedup drops, never adds).
//!
//! The module set is a closed enum — the orchestrator iterates
//! [`BypassModule::ALL`] and dispatches through [`BypassModule::generate`],
//! so adding a module is one variant plus one match arm.

mod header_mutation;
mod host_mutation;
mod path_mutation;
mod quirks;
pub mod tables;

pub use tables::{CharmapEntry, TableError, TableSet};

use gatecrash_payload::{BypassPayload, Fingerprint, Header, TargetUrl};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Lazily produced payload stream. Boxed so module dispatch stays a plain
/// enum match.
pub type PayloadIter = Box<dyn Iterator<Item = BypassPayload> + Send>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown module {0:?}")]
pub struct UnknownModule(pub String);

/// Inputs shared by every generator beyond the target itself.
#[derive(Clone)]
pub struct ModuleOpts {
    pub tables: Arc<TableSet>,
    /// Substitute authorities from `-shf`, tried by the host module.
    pub extra_hosts: Vec<String>,
    /// User-supplied spoof headers appended to the IP header table.
    pub spoof_headers: Vec<String>,
    /// User-supplied spoof IPs appended to the IP value table.
    pub spoof_ips: Vec<String>,
    /// Recon-resolved addresses for the target host, already sorted. Filled
    /// on demand by the orchestrator before a host-substitution run.
    pub resolved_ips: Vec<IpAddr>,
}

impl ModuleOpts {
    pub fn new(tables: Arc<TableSet>) -> Self {
        Self {
            tables,
            extra_hosts: Vec::new(),
            spoof_headers: Vec::new(),
            spoof_ips: Vec::new(),
            resolved_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassModule {
    DumbCheck,
    MidPaths,
    EndPaths,
    CaseSubstitution,
    CharEncode,
    UnicodePathNormalization,
    HttpHost,
    HttpHeadersIp,
    HttpHeadersScheme,
    HttpHeadersUrl,
    HttpHeadersPort,
    NginxBypasses,
    HaproxyBypasses,
    PathPrefix,
}

impl BypassModule {
    /// Canonical run order. `dumb_check` goes first so the baseline response
    /// is recorded before any mutation.
    pub const ALL: [BypassModule; 14] = [
        BypassModule::DumbCheck,
        BypassModule::MidPaths,
        BypassModule::EndPaths,
        BypassModule::CaseSubstitution,
        BypassModule::CharEncode,
        BypassModule::UnicodePathNormalization,
        BypassModule::HttpHost,
        BypassModule::HttpHeadersIp,
        BypassModule::HttpHeadersScheme,
        BypassModule::HttpHeadersUrl,
        BypassModule::HttpHeadersPort,
        BypassModule::NginxBypasses,
        BypassModule::HaproxyBypasses,
        BypassModule::PathPrefix,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BypassModule::DumbCheck => "dumb_check",
            BypassModule::MidPaths => "mid_paths",
            BypassModule::EndPaths => "end_paths",
            BypassModule::CaseSubstitution => "case_substitution",
            BypassModule::CharEncode => "char_encode",
            BypassModule::UnicodePathNormalization => "unicode_path_normalization",
            BypassModule::HttpHost => "http_host",
            BypassModule::HttpHeadersIp => "http_headers_ip",
            BypassModule::HttpHeadersScheme => "http_headers_scheme",
            BypassModule::HttpHeadersUrl => "http_headers_url",
            BypassModule::HttpHeadersPort => "http_headers_port",
            BypassModule::NginxBypasses => "nginx_bypasses",
            BypassModule::HaproxyBypasses => "haproxy_bypasses",
            BypassModule::PathPrefix => "path_prefix",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Expand a `-m` selection: `all`, or a comma-separated list. Order is
    /// preserved, duplicates collapse to the first occurrence.
    pub fn parse_selection(selection: &str) -> Result<Vec<Self>, UnknownModule> {
        if selection.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }
        let mut out = Vec::new();
        for part in selection.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let module =
                Self::from_name(part).ok_or_else(|| UnknownModule(part.to_string()))?;
            if !out.contains(&module) {
                out.push(module);
            }
        }
        Ok(out)
    }

    /// Whether the orchestrator should warm the recon cache before calling
    /// [`Self::generate`] for this module.
    pub fn wants_recon(self) -> bool {
        matches!(self, BypassModule::HttpHost)
    }

    /// Produce this module's deterministic payload sequence.
    pub fn generate(self, target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
        let inner = match self {
            BypassModule::DumbCheck => path_mutation::dumb_check(target),
            BypassModule::MidPaths => path_mutation::mid_paths(target, opts),
            BypassModule::EndPaths => path_mutation::end_paths(target, opts),
            BypassModule::CaseSubstitution => path_mutation::case_substitution(target),
            BypassModule::CharEncode => path_mutation::char_encode(target),
            BypassModule::UnicodePathNormalization => {
                path_mutation::unicode_path_normalization(target, opts)
            }
            BypassModule::HttpHost => host_mutation::http_host(target, opts),
            BypassModule::HttpHeadersIp => header_mutation::http_headers_ip(target, opts),
            BypassModule::HttpHeadersScheme => {
                header_mutation::http_headers_scheme(target, opts)
            }
            BypassModule::HttpHeadersUrl => header_mutation::http_headers_url(target, opts),
            BypassModule::HttpHeadersPort => header_mutation::http_headers_port(target, opts),
            BypassModule::NginxBypasses => quirks::nginx_bypasses(target, opts),
            BypassModule::HaproxyBypasses => quirks::haproxy_bypasses(target, opts),
            BypassModule::PathPrefix => quirks::path_prefix(target, opts),
        };
        Box::new(Dedup::new(inner))
    }
}

impl std::fmt::Display for BypassModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Module-local dedup: suppresses payloads whose fingerprint was already
/// yielded by this iterator. Dropping is the only permitted effect.
struct Dedup<I> {
    inner: I,
    seen: HashSet<Fingerprint>,
}

impl<I> Dedup<I> {
    fn new(inner: I) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
        }
    }
}

impl<I: Iterator<Item = BypassPayload>> Iterator for Dedup<I> {
    type Item = BypassPayload;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let payload = self.inner.next()?;
            if self.seen.insert(payload.fingerprint()) {
                return Some(payload);
            }
        }
    }
}

/// Shared constructor state for generators: the module name and the parsed
/// target, captured once and cloned into each lazy closure.
#[derive(Clone)]
pub(crate) struct Seed {
    module: &'static str,
    target: TargetUrl,
}

impl Seed {
    pub(crate) fn new(module: &'static str, target: &TargetUrl) -> Self {
        Self {
            module,
            target: target.clone(),
        }
    }

    /// Payload that only changes the request target.
    pub(crate) fn with_uri(&self, raw_uri: String) -> BypassPayload {
        let mut p = BypassPayload::from_target(self.module, &self.target);
        p.raw_uri = raw_uri;
        p.seal()
    }

    /// Payload that only adds headers.
    pub(crate) fn with_headers(&self, headers: Vec<Header>) -> BypassPayload {
        let mut p = BypassPayload::from_target(self.module, &self.target);
        p.headers = headers;
        p.seal()
    }

    /// Payload that changes both the request target and the headers.
    pub(crate) fn with_uri_and_headers(
        &self,
        raw_uri: String,
        headers: Vec<Header>,
    ) -> BypassPayload {
        let mut p = BypassPayload::from_target(self.module, &self.target);
        p.raw_uri = raw_uri;
        p.headers = headers;
        p.seal()
    }

    /// Unmodified request.
    pub(crate) fn plain(&self) -> BypassPayload {
        BypassPayload::from_target(self.module, &self.target).seal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_all_expands_in_order() {
        let all = BypassModule::parse_selection("all").unwrap();
        assert_eq!(all.len(), 14);
        assert_eq!(all[0], BypassModule::DumbCheck);
    }

    #[test]
    fn selection_list_and_duplicates() {
        let picked =
            BypassModule::parse_selection("mid_paths, dumb_check,mid_paths").unwrap();
        assert_eq!(
            picked,
            vec![BypassModule::MidPaths, BypassModule::DumbCheck]
        );
    }

    #[test]
    fn selection_rejects_unknown() {
        let err = BypassModule::parse_selection("mid_paths,bogus").unwrap_err();
        assert_eq!(err, UnknownModule("bogus".into()));
    }

    #[test]
    fn names_round_trip() {
        for m in BypassModule::ALL {
            assert_eq!(BypassModule::from_name(m.name()), Some(m));
        }
    }
}
