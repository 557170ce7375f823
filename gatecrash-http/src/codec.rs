//! Request serialization and response-head parsing.
//!
//! The writer is the reason this client exists: the request line and Host
//! header are emitted from the payload's bytes with no escaping, collapsing,
//! or case folding anywhere. The reader side is deliberately tolerant — a
//! scanner meets every malformed server there is — and always preserves the
//! raw head bytes next to the parsed view.

use gatecrash_common::ClientConfig;
use gatecrash_payload::BypassPayload;

use crate::error::{ClientError, ErrorKind};

pub(crate) const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub(crate) const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br, zstd";

/// Serialize the request exactly as the payload specifies it.
///
/// Wire shape: `{method} {raw_uri} HTTP/1.1\r\nHost: {host}\r\n…`. Payload
/// headers go out in order, duplicates and casing intact. Defaults are
/// appended only for names the payload does not carry (case-insensitive
/// comparison, since that is how servers match them).
pub(crate) fn write_request(payload: &BypassPayload, cfg: &ClientConfig) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + payload.raw_uri.len());
    buf.extend_from_slice(payload.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(payload.raw_uri.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(payload.host.as_bytes());
    buf.extend_from_slice(b"\r\n");

    for h in &payload.headers {
        buf.extend_from_slice(h.name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(h.value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    let has = |name: &str| {
        payload
            .headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(name))
    };

    if !has("User-Agent") {
        buf.extend_from_slice(b"User-Agent: ");
        buf.extend_from_slice(cfg.user_agent.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !has("Accept") {
        buf.extend_from_slice(b"Accept: ");
        buf.extend_from_slice(DEFAULT_ACCEPT.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !has("Accept-Encoding") {
        buf.extend_from_slice(b"Accept-Encoding: ");
        buf.extend_from_slice(DEFAULT_ACCEPT_ENCODING.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !has("Connection") {
        if cfg.reuse_connections {
            buf.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            buf.extend_from_slice(b"Connection: close\r\n");
        }
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

/// Parsed view of a response head. `raw` holds the status line and headers
/// byte-for-byte, obs-folding included.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseHead {
    pub raw: Vec<u8>,
    pub status_code: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_encoding: String,
    pub transfer_chunked: bool,
    pub server: String,
    pub location: String,
    pub connection_close: bool,
}

/// Parse status line + headers out of `raw` (everything up to and including
/// the blank line). Folded continuation lines extend the previous header's
/// value with a single space in the parsed view only.
pub(crate) fn parse_head(raw: Vec<u8>, host: &str) -> Result<ResponseHead, ClientError> {
    let text_end = raw.len();
    let line_end = find_crlf(&raw, 0).unwrap_or(text_end);
    let status_line = &raw[..line_end];

    let status_code = parse_status_line(status_line).ok_or_else(|| {
        ClientError::new(
            ErrorKind::ResponseParse,
            host,
            "read_head",
            format!(
                "bad status line: {:?}",
                String::from_utf8_lossy(&status_line[..status_line.len().min(64)])
            ),
        )
    })?;

    let mut head = ResponseHead {
        raw: Vec::new(),
        status_code,
        ..Default::default()
    };

    // Logical headers: join folded lines before interpreting.
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut pos = line_end + 2;
    while pos < text_end {
        let end = match find_crlf(&raw, pos) {
            Some(e) => e,
            None => text_end,
        };
        let line = &raw[pos..end];
        pos = end + 2;
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(last) = fields.last_mut() {
                last.1.push(' ');
                last.1
                    .push_str(String::from_utf8_lossy(trim_bytes(line)).trim());
            }
            continue;
        }
        let mut split = line.splitn(2, |&b| b == b':');
        let name = split.next().unwrap_or_default();
        let value = split.next().unwrap_or_default();
        fields.push((
            String::from_utf8_lossy(name).trim().to_string(),
            String::from_utf8_lossy(trim_bytes(value)).trim().to_string(),
        ));
    }

    for (name, value) in &fields {
        if name.eq_ignore_ascii_case("content-type") {
            head.content_type = value.clone();
        } else if name.eq_ignore_ascii_case("content-length") {
            head.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("content-encoding") {
            head.content_encoding = value.to_ascii_lowercase();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            head.transfer_chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("server") {
            head.server = value.clone();
        } else if name.eq_ignore_ascii_case("location") {
            head.location = value.clone();
        } else if name.eq_ignore_ascii_case("connection") {
            head.connection_close = value.to_ascii_lowercase().contains("close");
        }
    }

    head.raw = raw;
    Ok(head)
}

/// Accepts `HTTP/1.0` and `HTTP/1.1` with a three-digit status; the reason
/// phrase is free-form and may be absent.
fn parse_status_line(line: &[u8]) -> Option<u16> {
    let rest = line
        .strip_prefix(b"HTTP/1.0")
        .or_else(|| line.strip_prefix(b"HTTP/1.1"))?;
    let rest = rest.strip_prefix(b" ")?;
    if rest.len() < 3 {
        return None;
    }
    let digits = &rest[..3];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    match rest.get(3) {
        None | Some(b' ') => {}
        Some(_) => return None,
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// First `<title>…</title>` in the preview, case-insensitive. Only the
/// preview is scanned; a title past the cap is simply not reported.
pub(crate) fn extract_title(preview: &[u8]) -> String {
    let lower: Vec<u8> = preview.to_ascii_lowercase();
    let Some(open) = find_sub(&lower, b"<title") else {
        return String::new();
    };
    let Some(gt_rel) = lower[open..].iter().position(|&b| b == b'>') else {
        return String::new();
    };
    let text_start = open + gt_rel + 1;
    let Some(close_rel) = find_sub(&lower[text_start..], b"</title") else {
        return String::new();
    };
    String::from_utf8_lossy(&preview[text_start..text_start + close_rel])
        .trim()
        .to_string()
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
