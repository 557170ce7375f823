//! Port and scheme probing.
//!
//! One probe answers "does this ip:port speak TLS, plain HTTP, or nothing":
//! TLS handshake first (most 443-adjacent ports), then a raw `HEAD /` that
//! only counts if a well-formed status line comes back. Anything else marks
//! the port closed.

use rustls_pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Scheme detected on a port, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortScheme {
    Https,
    Http,
}

impl PortScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            PortScheme::Https => "https",
            PortScheme::Http => "http",
        }
    }
}

pub(crate) async fn probe_port(
    host: &str,
    ip: IpAddr,
    port: u16,
    budget: Duration,
    tls: &Arc<tokio_rustls::rustls::ClientConfig>,
) -> Option<PortScheme> {
    let addr = SocketAddr::new(ip, port);

    if try_tls(host, addr, budget, tls).await {
        tracing::debug!(%addr, "recon.probe.https");
        return Some(PortScheme::Https);
    }
    if try_http_head(host, addr, budget).await {
        tracing::debug!(%addr, "recon.probe.http");
        return Some(PortScheme::Http);
    }
    None
}

async fn try_tls(
    host: &str,
    addr: SocketAddr,
    budget: Duration,
    tls: &Arc<tokio_rustls::rustls::ClientConfig>,
) -> bool {
    let Ok(Ok(tcp)) = timeout(budget, TcpStream::connect(addr)).await else {
        return false;
    };
    let server_name = match host.parse::<IpAddr>() {
        Ok(ip) => ServerName::from(ip),
        Err(_) => match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => ServerName::from(addr.ip()),
        },
    };
    let connector = TlsConnector::from(tls.clone());
    matches!(
        timeout(budget, connector.connect(server_name, tcp)).await,
        Ok(Ok(_))
    )
}

async fn try_http_head(host: &str, addr: SocketAddr, budget: Duration) -> bool {
    let attempt = async {
        let mut tcp = TcpStream::connect(addr).await.ok()?;
        let req = format!("HEAD / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        tcp.write_all(req.as_bytes()).await.ok()?;
        let mut buf = [0u8; 16];
        let mut filled = 0;
        while filled < buf.len() {
            match tcp.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return None,
            }
        }
        Some(looks_like_status_line(&buf[..filled]))
    };
    matches!(timeout(budget, attempt).await, Ok(Some(true)))
}

/// `HTTP/1.x NNN` is enough evidence of an HTTP listener.
fn looks_like_status_line(bytes: &[u8]) -> bool {
    let Some(rest) = bytes
        .strip_prefix(b"HTTP/1.0 ")
        .or_else(|| bytes.strip_prefix(b"HTTP/1.1 "))
    else {
        return false;
    };
    rest.len() >= 3 && rest[..3].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_sniffing() {
        assert!(looks_like_status_line(b"HTTP/1.1 200 OK\r\n"));
        assert!(looks_like_status_line(b"HTTP/1.0 403"));
        assert!(!looks_like_status_line(b"SSH-2.0-OpenSSH_9.6"));
        assert!(!looks_like_status_line(b"HTTP/2 200"));
        assert!(!looks_like_status_line(b"HTTP/1.1 ok"));
    }

    #[tokio::test]
    async fn probe_detects_plain_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // The TLS attempt burns one connection before the HEAD probe, so
        // keep accepting.
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        let tls = gatecrash_http::tls::client_config(&gatecrash_common::ClientConfig::default())
            .unwrap();
        let got = probe_port(
            "127.0.0.1",
            addr.ip(),
            addr.port(),
            Duration::from_secs(2),
            &tls,
        )
        .await;
        assert_eq!(got, Some(PortScheme::Http));
    }

    #[tokio::test]
    async fn probe_marks_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tls = gatecrash_http::tls::client_config(&gatecrash_common::ClientConfig::default())
            .unwrap();
        let got = probe_port(
            "127.0.0.1",
            addr.ip(),
            addr.port(),
            Duration::from_millis(500),
            &tls,
        )
        .await;
        assert_eq!(got, None);
    }
}
