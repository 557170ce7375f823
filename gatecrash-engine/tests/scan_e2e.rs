//! End-to-end scenarios against a loopback echo server that reflects the
//! raw request bytes in its response body.

use async_trait::async_trait;
use gatecrash_common::{FilterConfig, ScanConfig};
use gatecrash_engine::{spawn_serializer, Finding, ResultSink, ScanInputs, Scanner};
use gatecrash_modules::{BypassModule, TableSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Default, Clone)]
struct CaptureSink {
    rows: Arc<Mutex<Vec<Finding>>>,
}

impl CaptureSink {
    fn rows(&self) -> Vec<Finding> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for CaptureSink {
    async fn append(&self, findings: Vec<Finding>) -> anyhow::Result<()> {
        self.rows.lock().unwrap().extend(findings);
        Ok(())
    }
}

/// Echo server: 200, body = the raw request bytes it received. Also keeps
/// a copy of every request for wire-level assertions.
async fn echo_server() -> (std::net::SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let seen = seen_writer.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16384];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                buf.truncate(n);
                seen.lock().unwrap().push(buf.clone());
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {n}\r\nConnection: close\r\n\r\n"
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&buf).await;
            });
        }
    });
    (addr, seen)
}

fn scanner(cfg: ScanConfig, sink: CaptureSink) -> Scanner {
    let (handle, _task) = spawn_serializer(Box::new(sink), 256);
    Scanner::new(
        cfg,
        ScanInputs::default(),
        Arc::new(TableSet::embedded().unwrap()),
        handle,
        CancellationToken::new(),
    )
    .unwrap()
}

fn cfg() -> ScanConfig {
    ScanConfig {
        threads: 4,
        max_retries: 0,
        client: gatecrash_common::ClientConfig {
            response_body_preview_size: 16384,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn dumb_check_preserves_raw_uri_on_the_wire() {
    let (addr, seen) = echo_server().await;
    let sink = CaptureSink::default();
    let s = scanner(cfg(), sink.clone());

    s.run(
        &[format!("http://{addr}/admin/..;/")],
        &[BypassModule::DumbCheck],
    )
    .await
    .unwrap();

    let wire = seen.lock().unwrap();
    assert_eq!(wire.len(), 1);
    let first_line = b"GET /admin/..;/ HTTP/1.1\r\n";
    assert!(
        wire[0].windows(first_line.len()).any(|w| w == first_line),
        "request line mangled: {:?}",
        String::from_utf8_lossy(&wire[0])
    );
}

#[tokio::test]
async fn case_substitution_first_wire_request_toggles_second_letter() {
    let (addr, seen) = echo_server().await;
    let sink = CaptureSink::default();
    let mut c = cfg();
    c.threads = 1; // keep the wire order equal to the generation order
    let s = scanner(c, sink.clone());

    s.run(
        &[format!("http://{addr}/Admin")],
        &[BypassModule::CaseSubstitution],
    )
    .await
    .unwrap();

    let wire = seen.lock().unwrap();
    let first = String::from_utf8_lossy(&wire[0]);
    assert!(
        first.starts_with("GET /aDmin HTTP/1.1\r\n"),
        "expected /aDmin first, got {first:?}"
    );
}

#[tokio::test]
async fn headers_ip_leads_with_appengine_and_stays_single_header() {
    let (addr, seen) = echo_server().await;
    let sink = CaptureSink::default();
    let mut c = cfg();
    c.threads = 1;
    let s = scanner(c, sink.clone());

    s.run(
        &[format!("http://{addr}/private")],
        &[BypassModule::HttpHeadersIp],
    )
    .await
    .unwrap();

    let wire = seen.lock().unwrap();
    let first = String::from_utf8_lossy(&wire[0]);
    assert!(first.contains("X-AppEngine-Trusted-IP-Request: 1\r\n"));

    // Spot-check later requests: exactly one spoof header each.
    for raw in wire.iter().skip(1).take(20) {
        let text = String::from_utf8_lossy(raw);
        let spoof_lines = text
            .lines()
            .filter(|l| {
                let lower = l.to_ascii_lowercase();
                lower.starts_with("x-") || lower.starts_with("forwarded")
                    || lower.starts_with("true-client-ip")
                    || lower.starts_with("cf-connecting-ip")
                    || lower.starts_with("client-ip")
                    || lower.starts_with("via")
                    || lower.starts_with("fastly")
            })
            .count();
        assert_eq!(spoof_lines, 1, "multiple spoof headers in {text:?}");
    }
}

#[tokio::test]
async fn end_paths_preserves_query_end_to_end() {
    let (addr, seen) = echo_server().await;
    let sink = CaptureSink::default();
    let mut c = cfg();
    c.threads = 1;
    let s = scanner(c, sink.clone());

    s.run(
        &[format!("http://{addr}/admin?x=1")],
        &[BypassModule::EndPaths],
    )
    .await
    .unwrap();

    let wire = seen.lock().unwrap();
    assert!(!wire.is_empty());
    for raw in wire.iter() {
        let text = String::from_utf8_lossy(raw);
        let request_line = text.lines().next().unwrap_or_default();
        assert!(request_line.starts_with("GET /admin"));
        // The original query always rides at the end of the mutated path.
        assert!(
            request_line.contains("?x=1"),
            "query dropped in {request_line:?}"
        );
    }
}

#[tokio::test]
async fn status_filter_yields_no_findings_but_counts_requests() {
    let (addr, _seen) = echo_server().await;
    let sink = CaptureSink::default();
    let mut c = cfg();
    // The echo server only answers 200; insist on 301/418.
    c.filters = FilterConfig {
        match_status_codes: Some(vec![301, 418]),
        ..Default::default()
    };
    let s = scanner(c, sink.clone());

    let summary = s
        .run(&[format!("http://{addr}/x")], &[BypassModule::DumbCheck])
        .await
        .unwrap();

    assert_eq!(summary.findings, 0);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(s.metrics().snapshot().completed, 1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(sink.rows().is_empty());
}

#[tokio::test]
async fn findings_carry_decodable_tokens() {
    let (addr, _seen) = echo_server().await;
    let sink = CaptureSink::default();
    let s = scanner(cfg(), sink.clone());

    s.run(&[format!("http://{addr}/tok")], &[BypassModule::DumbCheck])
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    let decoded = gatecrash_payload::PayloadToken::decode(&rows[0].debug_token).unwrap();
    assert_eq!(decoded.raw_uri, "/tok");
    assert_eq!(decoded.bypass_module, "dumb_check");
}
