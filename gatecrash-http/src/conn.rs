//! Connection establishment and pooling.
//!
//! Pool entries are keyed by `(scheme, connect_host, connect_port, sni)` —
//! the same wire bytes sent through a different dial target or SNI are a
//! different connection class and must not share sockets. Entries are FIFO
//! per key, liveness-checked on checkout, and dropped on any I/O error or
//! idle expiry.

use gatecrash_common::ClientConfig;
use gatecrash_payload::Scheme;
use rustls_pki_types::ServerName;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::either::Either;

use crate::error::{classify_io, ClientError, ErrorKind};

/// One established connection, plaintext or TLS.
pub(crate) type Stream = Either<TcpStream, TlsStream<TcpStream>>;

fn socket_of(stream: &Stream) -> &TcpStream {
    match stream {
        Either::Left(tcp) => tcp,
        Either::Right(tls) => tls.get_ref().0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub sni: String,
}

struct Idle {
    stream: Stream,
    since: Instant,
}

/// Per-key FIFO free lists behind one mutex; entries expire by idle time.
// FIXME: add a per-key in-flight cap so one slow origin cannot hold every
// worker in connect at the same time.
pub(crate) struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, VecDeque<Idle>>>,
    idle_timeout: Duration,
    max_idle_per_key: usize,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration, max_idle_per_key: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
            max_idle_per_key,
        }
    }

    /// Pop the oldest live connection for the key, discarding expired or
    /// half-closed entries along the way.
    pub fn checkout(&self, key: &PoolKey) -> Option<Stream> {
        let mut idle = self.idle.lock().expect("pool lock");
        let list = idle.get_mut(key)?;
        while let Some(entry) = list.pop_front() {
            if entry.since.elapsed() > self.idle_timeout {
                continue;
            }
            if is_live(&entry.stream) {
                return Some(entry.stream);
            }
        }
        None
    }

    pub fn checkin(&self, key: PoolKey, stream: Stream) {
        let mut idle = self.idle.lock().expect("pool lock");
        let list = idle.entry(key).or_default();
        if list.len() >= self.max_idle_per_key {
            // Oldest entry makes room; it is the most likely to be stale.
            list.pop_front();
        }
        list.push_back(Idle {
            stream,
            since: Instant::now(),
        });
    }

    /// Drop every pooled connection.
    pub fn drain(&self) {
        self.idle.lock().expect("pool lock").clear();
    }
}

/// A pooled socket is reusable if the peer has not closed it and no stray
/// bytes are waiting. Stray bytes mean a desynced session; discard.
fn is_live(stream: &Stream) -> bool {
    let mut probe = [0u8; 1];
    match socket_of(stream).try_read(&mut probe) {
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

/// Dial `host:port`, optionally through an HTTP CONNECT proxy, and wrap in
/// TLS when the scheme wants it. `sni` is the name presented on handshake.
pub(crate) async fn establish(
    cfg: &ClientConfig,
    tls: &Arc<tokio_rustls::rustls::ClientConfig>,
    key: &PoolKey,
    log_host: &str,
) -> Result<Stream, ClientError> {
    let tcp = match &cfg.proxy {
        Some(proxy) => dial_via_proxy(cfg, proxy, &key.host, key.port, log_host).await?,
        None => dial_direct(cfg, &key.host, key.port, log_host).await?,
    };

    if key.scheme == Scheme::Http {
        return Ok(Either::Left(tcp));
    }

    let server_name = server_name_for(&key.sni, log_host)?;
    let connector = TlsConnector::from(tls.clone());
    let handshake = timeout(cfg.connect_timeout, connector.connect(server_name, tcp)).await;
    match handshake {
        Ok(Ok(stream)) => Ok(Either::Right(stream)),
        Ok(Err(e)) => Err(ClientError::new(
            ErrorKind::TlsHandshake,
            log_host,
            "tls",
            e,
        )
        .retryable()),
        Err(_) => Err(ClientError::new(
            ErrorKind::Timeout,
            log_host,
            "tls",
            format!("handshake exceeded {:?}", cfg.connect_timeout),
        )
        .retryable()),
    }
}

async fn dial_direct(
    cfg: &ClientConfig,
    host: &str,
    port: u16,
    log_host: &str,
) -> Result<TcpStream, ClientError> {
    let attempt = timeout(cfg.connect_timeout, TcpStream::connect((host, port))).await;
    match attempt {
        Ok(Ok(tcp)) => Ok(tcp),
        Ok(Err(e)) => {
            let kind = classify_io(&e);
            let err = ClientError::new(kind, log_host, "connect", e);
            Err(err.retryable())
        }
        Err(_) => Err(ClientError::new(
            ErrorKind::Timeout,
            log_host,
            "connect",
            format!("connect exceeded {:?}", cfg.connect_timeout),
        )
        .retryable()),
    }
}

/// CONNECT through an HTTP proxy; the tunnel then carries our raw bytes.
async fn dial_via_proxy(
    cfg: &ClientConfig,
    proxy: &str,
    host: &str,
    port: u16,
    log_host: &str,
) -> Result<TcpStream, ClientError> {
    let authority = proxy
        .strip_prefix("http://")
        .unwrap_or(proxy)
        .trim_end_matches('/');
    let (proxy_host, proxy_port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>().map_err(|_| {
                ClientError::new(
                    ErrorKind::ProxyError,
                    log_host,
                    "proxy_connect",
                    format!("bad proxy port in {proxy:?}"),
                )
            })?,
        ),
        None => (authority.to_string(), 8080),
    };

    let mut tcp = timeout(
        cfg.connect_timeout,
        TcpStream::connect((proxy_host.as_str(), proxy_port)),
    )
    .await
    .map_err(|_| {
        ClientError::new(
            ErrorKind::ProxyError,
            log_host,
            "proxy_connect",
            format!("proxy dial exceeded {:?}", cfg.connect_timeout),
        )
        .retryable()
    })?
    .map_err(|e| {
        ClientError::new(ErrorKind::ProxyError, log_host, "proxy_connect", e).retryable()
    })?;

    let connect_req = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
    );
    tcp.write_all(connect_req.as_bytes()).await.map_err(|e| {
        ClientError::new(ErrorKind::ProxyError, log_host, "proxy_connect", e).retryable()
    })?;

    // Read the proxy's status line plus headers; require a 2xx.
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(cfg.connect_timeout, tcp.read(&mut byte))
            .await
            .map_err(|_| {
                ClientError::new(
                    ErrorKind::ProxyError,
                    log_host,
                    "proxy_connect",
                    "proxy response timed out",
                )
                .retryable()
            })?
            .map_err(|e| {
                ClientError::new(ErrorKind::ProxyError, log_host, "proxy_connect", e).retryable()
            })?;
        if n == 0 {
            return Err(ClientError::new(
                ErrorKind::ProxyError,
                log_host,
                "proxy_connect",
                "proxy closed during CONNECT",
            )
            .retryable());
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return Err(ClientError::new(
                ErrorKind::ProxyError,
                log_host,
                "proxy_connect",
                "proxy CONNECT response too large",
            ));
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let ok = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code));
    if !ok {
        return Err(ClientError::new(
            ErrorKind::ProxyError,
            log_host,
            "proxy_connect",
            format!("proxy refused CONNECT: {}", head.lines().next().unwrap_or("")),
        ));
    }
    Ok(tcp)
}

fn server_name_for(sni: &str, log_host: &str) -> Result<ServerName<'static>, ClientError> {
    if let Ok(ip) = sni.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }
    ServerName::try_from(sni.to_string()).map_err(|e| {
        ClientError::new(
            ErrorKind::RequestBuild,
            log_host,
            "tls",
            format!("invalid SNI {sni:?}: {e}"),
        )
    })
}

/// Split `host[:port]` into dial parts; IPv6 brackets are respected and the
/// scheme default fills a missing port.
pub(crate) fn split_authority(authority: &str, scheme: Scheme) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| scheme.default_port());
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) && !p.is_empty() => {
            (h.to_string(), p.parse().unwrap_or_else(|_| scheme.default_port()))
        }
        _ => (authority.to_string(), scheme.default_port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_splitting() {
        assert_eq!(split_authority("h", Scheme::Http), ("h".into(), 80));
        assert_eq!(split_authority("h", Scheme::Https), ("h".into(), 443));
        assert_eq!(split_authority("h:8080", Scheme::Http), ("h".into(), 8080));
        assert_eq!(
            split_authority("[::1]:8443", Scheme::Https),
            ("::1".into(), 8443)
        );
        assert_eq!(split_authority("[::1]", Scheme::Http), ("::1".into(), 80));
        // A name with a non-numeric suffix is all host.
        assert_eq!(
            split_authority("svc:name", Scheme::Http),
            ("svc:name".into(), 80)
        );
    }

    #[tokio::test]
    async fn pool_checkout_prefers_fifo_and_drops_stale() {
        let pool = ConnectionPool::new(Duration::from_millis(10), 4);
        let key = PoolKey {
            scheme: Scheme::Http,
            host: "127.0.0.1".into(),
            port: 1,
            sni: String::new(),
        };
        // Nothing pooled yet.
        assert!(pool.checkout(&key).is_none());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();

        pool.checkin(key.clone(), Either::Left(client));
        assert!(pool.checkout(&key).is_some());

        // Re-inserted entry expires after the idle timeout.
        let client = TcpStream::connect(addr).await.unwrap();
        let _server2 = listener.accept().await.unwrap();
        pool.checkin(key.clone(), Either::Left(client));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.checkout(&key).is_none());
    }
}
