//! Bounded response-body reading.
//!
//! The scanner never wants whole bodies — a preview is enough to classify a
//! finding — so only a bounded prefix of the body is ever retained. What
//! happens to the rest depends on the mode:
//!
//! - default (`stream_response_body = false`): the framed body is drained
//!   to its end (up to a hard drain ceiling), discarding everything past
//!   the retained prefix, so ordinary responses leave the connection clean
//!   and poolable;
//! - streaming (`stream_response_body = true`): reading stops the moment
//!   the cap is reached; a body cut off mid-framing poisons the connection
//!   and the caller drops it.

use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::codec::ResponseHead;
use crate::error::{classify_io, ClientError};

/// Ceiling on how far the default mode will drain looking for the framing
/// end; a body larger than this costs the connection instead of the time.
const MAX_DRAIN_BYTES: u64 = 1_048_576;

/// What came back from the body phase.
#[derive(Debug, Default)]
pub(crate) struct BodyOutcome {
    /// Body bytes actually read off the socket (pre-decode).
    pub raw_read: u64,
    /// Decoded preview, at most the configured cap.
    pub preview: Vec<u8>,
    /// Framing fully consumed; the connection may be reused.
    pub complete: bool,
}

/// Compressed payloads need more wire bytes than decoded ones; retain a
/// generous multiple so the decoder can fill the preview.
fn retain_limit(cap: usize, encoded: bool) -> u64 {
    if encoded {
        (cap as u64).saturating_mul(16).clamp(4096, 262_144)
    } else {
        cap as u64
    }
}

/// Body bytes flow through here: everything is counted, only the prefix
/// the preview decoder needs is kept.
struct BodyBuf {
    retained: Vec<u8>,
    keep: usize,
    total: u64,
}

impl BodyBuf {
    fn new(keep: u64) -> Self {
        Self {
            retained: Vec::with_capacity((keep as usize).min(4096)),
            keep: keep as usize,
            total: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let room = self.keep.saturating_sub(self.retained.len());
        if room > 0 {
            self.retained
                .extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    }
}

pub(crate) async fn read_body<S>(
    stream: &mut S,
    head: &ResponseHead,
    method: &str,
    cap: usize,
    stream_mode: bool,
    host: &str,
) -> Result<BodyOutcome, ClientError>
where
    S: AsyncRead + Unpin,
{
    // Bodiless by definition, regardless of headers.
    if method.eq_ignore_ascii_case("HEAD")
        || head.status_code / 100 == 1
        || head.status_code == 204
        || head.status_code == 304
    {
        return Ok(BodyOutcome {
            complete: true,
            ..Default::default()
        });
    }

    let encoded = !head.content_encoding.is_empty() && head.content_encoding != "identity";
    let keep = retain_limit(cap, encoded);
    let read_limit = if stream_mode {
        keep
    } else {
        keep.max(MAX_DRAIN_BYTES)
    };

    let mut reader = BufReader::new(stream);
    let mut buf = BodyBuf::new(keep);

    let complete = if head.transfer_chunked {
        read_chunked(&mut reader, &mut buf, read_limit, host).await?
    } else if let Some(cl) = head.content_length {
        read_exactly(&mut reader, &mut buf, cl.min(read_limit), host).await?;
        cl <= read_limit
    } else {
        // No framing: the server will close the connection when done.
        read_until_eof_or(&mut reader, &mut buf, read_limit, host).await?
    };

    let preview = decode_preview(&buf.retained, &head.content_encoding, cap);
    Ok(BodyOutcome {
        raw_read: buf.total,
        preview,
        complete,
    })
}

fn body_err(e: &std::io::Error, host: &str) -> ClientError {
    // Body-phase failures are results we could not finish reading, not
    // grounds for a retry that would re-send the request.
    ClientError::new(classify_io(e), host, "read_body", e)
}

async fn read_exactly<R>(
    reader: &mut R,
    buf: &mut BodyBuf,
    want: u64,
    host: &str,
) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = want;
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        let room = remaining.min(chunk.len() as u64) as usize;
        let n = reader
            .read(&mut chunk[..room])
            .await
            .map_err(|e| body_err(&e, host))?;
        if n == 0 {
            return Err(body_err(
                &std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "body ended early"),
                host,
            ));
        }
        buf.push(&chunk[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

async fn read_until_eof_or<R>(
    reader: &mut R,
    buf: &mut BodyBuf,
    limit: u64,
    host: &str,
) -> Result<bool, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if buf.total >= limit {
            return Ok(false);
        }
        let room = ((limit - buf.total) as usize).min(chunk.len());
        let n = reader
            .read(&mut chunk[..room])
            .await
            .map_err(|e| body_err(&e, host))?;
        if n == 0 {
            return Ok(true);
        }
        buf.push(&chunk[..n]);
    }
}

/// Minimal chunked-transfer reader: size line, payload, CRLF, repeat; a zero
/// chunk plus the trailer blank line ends the stream cleanly. Only chunk
/// payload bytes count toward the limit.
async fn read_chunked<R>(
    reader: &mut R,
    buf: &mut BodyBuf,
    limit: u64,
    host: &str,
) -> Result<bool, ClientError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = read_line(reader, host).await?;
        let size_text = line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = u64::from_str_radix(size_text, 16).map_err(|_| {
            ClientError::new(
                crate::error::ErrorKind::ResponseParse,
                host,
                "read_body",
                format!("bad chunk size {size_text:?}"),
            )
        })?;

        if size == 0 {
            // Consume trailers up to the blank line.
            loop {
                let trailer = read_line(reader, host).await?;
                if trailer.is_empty() {
                    return Ok(true);
                }
            }
        }

        if buf.total + size > limit {
            // Reading on would blow the budget; leave the framing dirty.
            let room = limit - buf.total;
            read_exactly(reader, buf, room, host).await?;
            return Ok(false);
        }

        read_exactly(reader, buf, size, host).await?;

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| body_err(&e, host))?;
    }
}

async fn read_line<R>(reader: &mut R, host: &str) -> Result<String, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .await
            .map_err(|e| body_err(&e, host))?;
        if n == 0 {
            return Err(ClientError::new(
                crate::error::ErrorKind::ResponseParse,
                host,
                "read_body",
                "eof inside chunked framing",
            ));
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte[0]);
        if line.len() > 1024 {
            return Err(ClientError::new(
                crate::error::ErrorKind::ResponseParse,
                host,
                "read_body",
                "chunk size line too long",
            ));
        }
    }
}

/// Decode up to `cap` preview bytes. A decoder error (truncated input is
/// routine here) keeps whatever decoded so far; unknown encodings fall back
/// to the raw bytes.
fn decode_preview(raw: &[u8], encoding: &str, cap: usize) -> Vec<u8> {
    if cap == 0 {
        return Vec::new();
    }
    match encoding {
        "" | "identity" => raw[..raw.len().min(cap)].to_vec(),
        "gzip" | "x-gzip" => capped_read(flate2::read::MultiGzDecoder::new(raw), cap),
        "deflate" => {
            let zlib = capped_read(flate2::read::ZlibDecoder::new(raw), cap);
            if !zlib.is_empty() {
                zlib
            } else {
                // Some servers send raw deflate despite the name.
                capped_read(flate2::read::DeflateDecoder::new(raw), cap)
            }
        }
        "br" => capped_read(brotli::Decompressor::new(raw, 4096), cap),
        "zstd" => match zstd::stream::read::Decoder::new(raw) {
            Ok(dec) => capped_read(dec, cap),
            Err(_) => raw[..raw.len().min(cap)].to_vec(),
        },
        _ => raw[..raw.len().min(cap)].to_vec(),
    }
}

fn capped_read<R: Read>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(cap.min(4096));
    let mut buf = [0u8; 1024];
    while out.len() < cap {
        let room = (cap - out.len()).min(buf.len());
        match reader.read(&mut buf[..room]) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            // Truncated input past the cap boundary is expected.
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status_code: status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn default_mode_drains_past_the_preview() {
        let mut h = head(200);
        h.content_length = Some(26);
        let mut cursor = std::io::Cursor::new(b"abcdefghijklmnopqrstuvwxyz".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 4, false, "h").await.unwrap();
        assert_eq!(out.preview, b"abcd");
        // The whole framed body was consumed, so the connection stays clean.
        assert_eq!(out.raw_read, 26);
        assert!(out.complete);
    }

    #[tokio::test]
    async fn stream_mode_stops_at_the_cap() {
        let mut h = head(200);
        h.content_length = Some(26);
        let mut cursor = std::io::Cursor::new(b"abcdefghijklmnopqrstuvwxyz".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 4, true, "h").await.unwrap();
        assert_eq!(out.preview, b"abcd");
        assert_eq!(out.raw_read, 4);
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn content_length_exact_is_complete() {
        let mut h = head(200);
        h.content_length = Some(5);
        let mut cursor = std::io::Cursor::new(b"hello".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 1024, false, "h").await.unwrap();
        assert_eq!(out.preview, b"hello");
        assert!(out.complete);
    }

    #[tokio::test]
    async fn zero_cap_keeps_headers_only() {
        let mut h = head(200);
        h.content_length = Some(5);
        let mut cursor = std::io::Cursor::new(b"hello".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 0, false, "h").await.unwrap();
        assert!(out.preview.is_empty());
        // Default mode still drains the framing for reuse.
        assert_eq!(out.raw_read, 5);
        assert!(out.complete);

        let mut cursor = std::io::Cursor::new(b"hello".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 0, true, "h").await.unwrap();
        assert!(out.preview.is_empty());
        assert_eq!(out.raw_read, 0);
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn head_requests_have_no_body() {
        let mut h = head(200);
        h.content_length = Some(100);
        let mut cursor = std::io::Cursor::new(Vec::new());
        let out = read_body(&mut cursor, &h, "HEAD", 1024, false, "h").await.unwrap();
        assert!(out.complete);
        assert_eq!(out.raw_read, 0);
    }

    #[tokio::test]
    async fn chunked_body_reassembles() {
        let mut h = head(200);
        h.transfer_chunked = true;
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        let out = read_body(&mut cursor, &h, "GET", 1024, false, "h").await.unwrap();
        assert_eq!(out.preview, b"hello world");
        assert!(out.complete);
    }

    #[tokio::test]
    async fn chunked_default_mode_drains_and_caps_preview() {
        let mut h = head(200);
        h.transfer_chunked = true;
        let wire = b"10\r\n0123456789abcdef\r\n0\r\n\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        let out = read_body(&mut cursor, &h, "GET", 8, false, "h").await.unwrap();
        assert_eq!(out.preview, b"01234567");
        assert_eq!(out.raw_read, 16);
        assert!(out.complete);
    }

    #[tokio::test]
    async fn chunked_stream_mode_cap_hit_marks_incomplete() {
        let mut h = head(200);
        h.transfer_chunked = true;
        let wire = b"10\r\n0123456789abcdef\r\n0\r\n\r\n".to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        let out = read_body(&mut cursor, &h, "GET", 8, true, "h").await.unwrap();
        assert_eq!(out.preview, b"01234567");
        assert_eq!(out.raw_read, 8);
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn eof_terminated_body() {
        let h = head(200);
        let mut cursor = std::io::Cursor::new(b"until eof".to_vec());
        let out = read_body(&mut cursor, &h, "GET", 1024, false, "h").await.unwrap();
        assert_eq!(out.preview, b"until eof");
        assert!(out.complete);
    }

    #[tokio::test]
    async fn gzip_preview_is_decoded() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"<html><title>Hidden</title></html>").unwrap();
        let compressed = enc.finish().unwrap();

        let mut h = head(200);
        h.content_length = Some(compressed.len() as u64);
        h.content_encoding = "gzip".into();
        let mut cursor = std::io::Cursor::new(compressed);
        let out = read_body(&mut cursor, &h, "GET", 1024, false, "h").await.unwrap();
        assert_eq!(out.preview, b"<html><title>Hidden</title></html>");
        assert!(out.complete);
    }

    #[test]
    fn deflate_raw_fallback() {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"raw deflate body").unwrap();
        let compressed = enc.finish().unwrap();
        let preview = decode_preview(&compressed, "deflate", 1024);
        assert_eq!(preview, b"raw deflate body");
    }

    #[test]
    fn unknown_encoding_passes_raw() {
        assert_eq!(decode_preview(b"abc", "snappy", 10), b"abc");
    }
}
