//! Raw HTTP/1.1 client with byte-exact request fidelity.
//!
//! - Request line and `Host` header are emitted from the payload bytes:
//!   no percent-canonicalization, no `..` collapsing, no case folding
//! - Header order, casing, and duplicates go out as supplied
//! - TLS via rustls with selectable ciphers, shared session cache, and no
//!   certificate verification (the targets are arbitrary origins)
//! - Connection pool keyed by `(scheme, dial host, port, SNI)`
//! - Optional HTTP CONNECT proxy
//! - Bounded body reads with gzip/deflate/br/zstd preview decoding
//!
//! Every failure is classified into the [`ErrorKind`] taxonomy and carries
//! the host plus the client sub-step that raised it; the worker pool feeds
//! those into [`HostBudgets`] for per-host halt decisions.

mod body;
mod codec;
mod conn;
pub mod error;
pub mod tls;

pub use error::{Action, ClientError, ErrorKind, ErrorStats, HostBudgets};

use gatecrash_common::ClientConfig;
use gatecrash_payload::BypassPayload;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use conn::{establish, split_authority, ConnectionPool, PoolKey, Stream};

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// What the client hands back for one completed exchange. HTTP status codes
/// are results here, never errors.
#[derive(Debug, Clone)]
pub struct ResponseDetails {
    pub status_code: u16,
    pub content_type: String,
    /// `Content-Length` as announced; `None` when absent.
    pub content_length: Option<u64>,
    /// Body bytes actually read off the socket (may be less than announced).
    pub response_bytes: u64,
    pub server_info: String,
    pub redirect_url: String,
    /// First `<title>` inside the preview, if any.
    pub title: String,
    /// Status line + headers, raw, folding preserved.
    pub response_headers: Vec<u8>,
    /// Decoded body prefix, bounded by `response_body_preview_size`.
    pub response_body_preview: Vec<u8>,
    pub response_time: Duration,
    /// Echo of the payload token for correlation.
    pub debug_token: String,
}

pub struct RawClient {
    cfg: ClientConfig,
    tls: Arc<tokio_rustls::rustls::ClientConfig>,
    pool: ConnectionPool,
}

impl RawClient {
    pub fn new(cfg: ClientConfig) -> Result<Self, ClientError> {
        let tls = tls::client_config(&cfg)?;
        let pool = ConnectionPool::new(cfg.pool_idle_timeout, 8);
        Ok(Self { cfg, tls, pool })
    }

    /// Transmit one payload and read the bounded response.
    ///
    /// The dial target is the payload's `connect_to` when set (host
    /// substitution), otherwise its `host`. SNI follows the dial host unless
    /// the config overrides it.
    pub async fn send(&self, payload: &BypassPayload) -> Result<ResponseDetails, ClientError> {
        let authority = payload
            .connect_to
            .clone()
            .unwrap_or_else(|| payload.host.clone());
        let (dial_host, dial_port) = split_authority(&authority, payload.scheme);
        let sni = self
            .cfg
            .sni
            .clone()
            .unwrap_or_else(|| dial_host.clone());
        let key = PoolKey {
            scheme: payload.scheme,
            host: dial_host,
            port: dial_port,
            sni,
        };

        let started = Instant::now();
        let (mut stream, reused) = match self.pool.checkout(&key) {
            Some(s) => (s, true),
            None => (
                establish(&self.cfg, &self.tls, &key, &authority).await?,
                false,
            ),
        };

        tracing::debug!(
            module = %payload.bypass_module,
            uri = %payload.raw_uri,
            dial = %authority,
            reused,
            "client.request.start"
        );

        let result = timeout(
            self.cfg.request_timeout,
            self.exchange(payload, &mut stream, &authority),
        )
        .await;

        let (head, outcome) = match result {
            Ok(Ok(parts)) => parts,
            Ok(Err(mut e)) => {
                // A stale pooled connection failing before any response byte
                // is always worth one fresh attempt.
                if reused && !e.retryable {
                    e.retryable = matches!(
                        e.kind,
                        ErrorKind::ConnectionReset | ErrorKind::Timeout
                    );
                }
                return Err(e);
            }
            Err(_) => {
                return Err(ClientError::new(
                    ErrorKind::Timeout,
                    &authority,
                    "request",
                    format!("request exceeded {:?}", self.cfg.request_timeout),
                ));
            }
        };

        let elapsed = started.elapsed();
        // `complete` already encodes the streaming story: a stream-mode read
        // that stopped at the cap left dirty framing and is not reusable.
        let reusable = outcome.complete
            && !head.connection_close
            && self.cfg.reuse_connections
            && !payload
                .headers
                .iter()
                .any(|h| {
                    h.name.eq_ignore_ascii_case("connection")
                        && h.value.eq_ignore_ascii_case("close")
                });
        if reusable {
            self.pool.checkin(key, stream);
        }

        let title = codec::extract_title(&outcome.preview);
        tracing::debug!(
            status = head.status_code,
            bytes = outcome.raw_read,
            elapsed_ms = elapsed.as_millis() as u64,
            "client.request.done"
        );

        Ok(ResponseDetails {
            status_code: head.status_code,
            content_type: head.content_type,
            content_length: head.content_length,
            response_bytes: outcome.raw_read,
            server_info: head.server,
            redirect_url: head.location,
            title,
            response_headers: head.raw,
            response_body_preview: outcome.preview,
            response_time: elapsed,
            debug_token: payload.payload_token.clone(),
        })
    }

    async fn exchange(
        &self,
        payload: &BypassPayload,
        stream: &mut Stream,
        authority: &str,
    ) -> Result<(codec::ResponseHead, body::BodyOutcome), ClientError> {
        let request = codec::write_request(payload, &self.cfg);
        stream.write_all(&request).await.map_err(|e| {
            ClientError::new(error::classify_io(&e), authority, "write", e).retryable()
        })?;
        stream.flush().await.map_err(|e| {
            ClientError::new(error::classify_io(&e), authority, "write", e).retryable()
        })?;

        let (head_raw, leftover) = read_head(stream, authority).await?;
        let head = codec::parse_head(head_raw, authority)?;

        let mut body_stream = std::io::Cursor::new(leftover).chain(stream);
        let outcome = body::read_body(
            &mut body_stream,
            &head,
            &payload.method,
            self.cfg.response_body_preview_size,
            self.cfg.stream_response_body,
            authority,
        )
        .await?;
        Ok((head, outcome))
    }

    /// Drop all pooled connections. Called when a module run finishes.
    pub fn drain(&self) {
        self.pool.drain();
    }
}

/// Read up to the blank line; returns the head bytes and whatever body
/// bytes were pulled in with the final read.
async fn read_head(
    stream: &mut Stream,
    authority: &str,
) -> Result<(Vec<u8>, Vec<u8>), ClientError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| {
            let err = ClientError::new(error::classify_io(&e), authority, "read_head", e);
            if buf.is_empty() { err.retryable() } else { err }
        })?;
        if n == 0 {
            // Before the first response byte a close is a retryable reset;
            // mid-head it is a malformed response.
            return Err(if buf.is_empty() {
                ClientError::new(
                    ErrorKind::ConnectionReset,
                    authority,
                    "read_head",
                    "connection closed before response head",
                )
                .retryable()
            } else {
                ClientError::new(
                    ErrorKind::ResponseParse,
                    authority,
                    "read_head",
                    "connection closed inside response head",
                )
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ClientError::new(
                ErrorKind::ResponseParse,
                authority,
                "read_head",
                "response head exceeds 64 KiB",
            ));
        }
    }
}

/// Offset one past the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatecrash_payload::TargetUrl;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// Loopback server that sends a canned response and captures the raw
    /// request bytes it saw.
    async fn one_shot_server(
        response: &'static [u8],
    ) -> (std::net::SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = vec![0u8; 8192];
            let n = sock.read(&mut seen).await.unwrap();
            seen.truncate(n);
            sock.write_all(response).await.unwrap();
            sock.shutdown().await.ok();
            let _ = tx.send(seen);
        });
        (addr, rx)
    }

    fn payload_for(addr: std::net::SocketAddr, raw_uri: &str) -> BypassPayload {
        let target = TargetUrl::parse(&format!("http://{addr}{raw_uri}")).unwrap();
        BypassPayload::from_target("dumb_check", &target).seal()
    }

    #[tokio::test]
    async fn raw_uri_reaches_the_wire_unchanged() {
        let (addr, seen) = one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let client = RawClient::new(ClientConfig::default()).unwrap();
        let p = payload_for(addr, "/admin/..;/");
        let details = client.send(&p).await.unwrap();
        assert_eq!(details.status_code, 200);

        let wire = seen.await.unwrap();
        let expected = format!("GET /admin/..;/ HTTP/1.1\r\nHost: {addr}\r\n");
        assert!(
            wire.windows(expected.len()).any(|w| w == expected.as_bytes()),
            "wire bytes mangled: {:?}",
            String::from_utf8_lossy(&wire)
        );
    }

    #[tokio::test]
    async fn response_fields_are_extracted() {
        let (addr, _seen) = one_shot_server(
            b"HTTP/1.1 301 Moved\r\nServer: nginx\r\nContent-Type: text/html\r\nLocation: /new\r\nContent-Length: 36\r\nConnection: close\r\n\r\n<html><title>Moved Here</title></ht>",
        )
        .await;
        let client = RawClient::new(ClientConfig::default()).unwrap();
        let p = payload_for(addr, "/x");
        let details = client.send(&p).await.unwrap();
        assert_eq!(details.status_code, 301);
        assert_eq!(details.server_info, "nginx");
        assert_eq!(details.redirect_url, "/new");
        assert_eq!(details.title, "Moved Here");
        assert_eq!(details.content_length, Some(36));
        assert_eq!(details.debug_token, p.payload_token);
        assert!(details.response_time <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn preview_cap_bounds_preview_default_mode_drains() {
        let (addr, _seen) = one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 26\r\nConnection: close\r\n\r\nabcdefghijklmnopqrstuvwxyz",
        )
        .await;
        let cfg = ClientConfig {
            response_body_preview_size: 10,
            ..Default::default()
        };
        let client = RawClient::new(cfg).unwrap();
        let details = client.send(&payload_for(addr, "/")).await.unwrap();
        assert_eq!(details.response_body_preview, b"abcdefghij");
        // Default mode reads the whole framed body, keeping only the preview.
        assert_eq!(details.response_bytes, 26);
    }

    #[tokio::test]
    async fn stream_mode_stops_reading_at_the_cap() {
        let (addr, _seen) = one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 26\r\nConnection: close\r\n\r\nabcdefghijklmnopqrstuvwxyz",
        )
        .await;
        let cfg = ClientConfig {
            response_body_preview_size: 10,
            stream_response_body: true,
            ..Default::default()
        };
        let client = RawClient::new(cfg).unwrap();
        let details = client.send(&payload_for(addr, "/")).await.unwrap();
        assert_eq!(details.response_body_preview, b"abcdefghij");
        // The reader closed on cap hit; nothing past it was pulled.
        assert_eq!(details.response_bytes, 10);
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        // Bind-then-drop gives a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let client = RawClient::new(cfg).unwrap();
        let err = client.send(&payload_for(addr, "/")).await.unwrap_err();
        assert!(err.retryable);
        assert!(matches!(
            err.kind,
            ErrorKind::ConnectionRefused | ErrorKind::Timeout | ErrorKind::ConnectionReset
        ));
    }

    #[tokio::test]
    async fn status_is_a_result_not_an_error() {
        let (addr, _seen) = one_shot_server(
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let client = RawClient::new(ClientConfig::default()).unwrap();
        let details = client.send(&payload_for(addr, "/secret")).await.unwrap();
        assert_eq!(details.status_code, 403);
    }
}
