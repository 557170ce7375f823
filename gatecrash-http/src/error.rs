//! Transport error taxonomy and the per-host error budget.
//!
//! Every failure below the orchestrator is a [`ClientError`]: a closed
//! [`ErrorKind`], the host it concerns, a static tag naming the client
//! sub-step that produced it, and the original error text for logs. The
//! budget side ([`HostBudgets`]) turns repeated failures against one host
//! into a halt signal so a dead origin cannot burn the whole payload
//! sequence timing out.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    TlsHandshake,
    ProxyError,
    DnsResolution,
    RequestBuild,
    ResponseParse,
    /// Derived: the host crossed its consecutive-failure budget.
    PermanentHost,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::TlsHandshake => "tls_handshake",
            ErrorKind::ProxyError => "proxy_error",
            ErrorKind::DnsResolution => "dns_resolution",
            ErrorKind::RequestBuild => "request_build",
            ErrorKind::ResponseParse => "response_parse",
            ErrorKind::PermanentHost => "permanent_host",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A classified transport/protocol failure for one request attempt.
#[derive(Debug, Error, Clone)]
#[error("{} for {host} in {step}: {detail}", kind.as_str())]
pub struct ClientError {
    pub kind: ErrorKind,
    pub host: String,
    /// Client sub-step that raised the error (`connect`, `tls`, `write`, …).
    pub step: &'static str,
    /// Original error text, kept verbatim for logs.
    pub detail: String,
    /// Whether the worker pool may retry this attempt. Set where the
    /// context is known: a reset before the first response byte is
    /// retryable, the same reset mid-body is not.
    pub retryable: bool,
}

impl ClientError {
    pub fn new(kind: ErrorKind, host: &str, step: &'static str, detail: impl ToString) -> Self {
        Self {
            kind,
            host: host.to_string(),
            step,
            detail: detail.to_string(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Map an I/O error onto the taxonomy. OS error codes decide first; message
/// fragments cover the platforms (and wrapped errors) where they do not.
pub fn classify_io(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::TimedOut | Io::WouldBlock => return ErrorKind::Timeout,
        Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => {
            return ErrorKind::ConnectionReset
        }
        Io::ConnectionRefused => return ErrorKind::ConnectionRefused,
        Io::NotConnected | Io::UnexpectedEof => return ErrorKind::ConnectionReset,
        _ => {}
    }

    let text = err.to_string().to_ascii_lowercase();
    if text.contains("forcibly closed") || text.contains("connection reset") {
        ErrorKind::ConnectionReset
    } else if text.contains("handshake") || text.contains("certificate") || text.contains("tls") {
        ErrorKind::TlsHandshake
    } else if text.contains("timed out") || text.contains("timeout") {
        ErrorKind::Timeout
    } else if text.contains("dns") || text.contains("name or service not known") || text.contains("lookup") {
        ErrorKind::DnsResolution
    } else if text.contains("proxy") {
        ErrorKind::ProxyError
    } else {
        ErrorKind::Unknown
    }
}

/// What the caller should do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// The host crossed its budget: stop dispatching this module's payloads
    /// to it.
    HaltModuleForHost,
}

#[derive(Debug, Default)]
struct HostState {
    consecutive_failures: u32,
    last_error: Option<Instant>,
    blocked: bool,
}

/// Aggregates returned by [`HostBudgets::stats`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ErrorStats {
    pub total: u64,
    pub per_kind: BTreeMap<&'static str, u64>,
    pub blocked_hosts: Vec<String>,
    pub first_error: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
}

/// Per-host consecutive-failure accounting, shared across the worker pool.
///
/// Counters reset on any success for the host. Once a host crosses
/// `max_consecutive` failures inside the window it is blocked until
/// [`HostBudgets::release_blocks`] (called between module runs).
pub struct HostBudgets {
    max_consecutive: u32,
    window: Duration,
    hosts: DashMap<String, HostState>,
    totals: DashMap<ErrorKind, u64>,
    timestamps: Mutex<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl HostBudgets {
    pub fn new(max_consecutive: u32, window: Duration) -> Self {
        Self {
            max_consecutive,
            window,
            hosts: DashMap::new(),
            totals: DashMap::new(),
            timestamps: Mutex::new((None, None)),
        }
    }

    /// Record one failure; returns whether the module should halt for this
    /// host. A failure outside the window restarts the streak at one.
    pub fn record(&self, host: &str, kind: ErrorKind) -> Action {
        *self.totals.entry(kind).or_insert(0) += 1;
        {
            let mut ts = self.timestamps.lock().expect("timestamps lock");
            let now = Utc::now();
            if ts.0.is_none() {
                ts.0 = Some(now);
            }
            ts.1 = Some(now);
        }

        let mut state = self.hosts.entry(host.to_string()).or_default();
        let now = Instant::now();
        let in_window = state
            .last_error
            .is_some_and(|t| now.duration_since(t) <= self.window);
        state.consecutive_failures = if in_window {
            state.consecutive_failures + 1
        } else {
            1
        };
        state.last_error = Some(now);

        if state.consecutive_failures >= self.max_consecutive {
            if !state.blocked {
                tracing::warn!(
                    host,
                    failures = state.consecutive_failures,
                    "errors.host_blocked"
                );
                *self.totals.entry(ErrorKind::PermanentHost).or_insert(0) += 1;
            }
            state.blocked = true;
            Action::HaltModuleForHost
        } else {
            Action::Continue
        }
    }

    /// A completed request resets the host's streak.
    pub fn success(&self, host: &str) {
        if let Some(mut state) = self.hosts.get_mut(host) {
            state.consecutive_failures = 0;
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.hosts.get(host).is_some_and(|s| s.blocked)
    }

    /// Clear per-host streaks and blocks at a module boundary. Totals and
    /// timestamps survive; they describe the whole run.
    pub fn release_blocks(&self) {
        self.hosts.clear();
    }

    pub fn stats(&self) -> ErrorStats {
        let per_kind: BTreeMap<&'static str, u64> = self
            .totals
            .iter()
            .map(|e| (e.key().as_str(), *e.value()))
            .collect();
        let total = per_kind.values().sum();
        let blocked_hosts = self
            .hosts
            .iter()
            .filter(|e| e.value().blocked)
            .map(|e| e.key().clone())
            .collect();
        let (first_error, last_error) = *self.timestamps.lock().expect("timestamps lock");
        ErrorStats {
            total,
            per_kind,
            blocked_hosts,
            first_error,
            last_error,
        }
    }
}
