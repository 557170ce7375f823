//! Reversible payload tokens.
//!
//! Every dispatched request carries a compact token that round-trips the
//! whole [`BypassPayload`]. Results embed it as `debug_token`, which makes a
//! finding reproducible with `-resend <token>` long after the run.
//!
//! Encoding: a sequence of `(tag: u8, len: varint, bytes)` tuples in fixed
//! order — module, method, scheme, host, raw URI, header count, then
//! name/value pairs — wrapped in URL-safe base64 without padding. The
//! decoder is strict: wrong tag order, truncation, or trailing bytes are
//! typed errors, never a partially filled payload.

use crate::{BypassPayload, Header, Scheme};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not URL-safe base64")]
    InvalidBase64,
    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("token truncated while reading {0}")]
    Truncated(&'static str),
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("unsupported scheme value {0:?}")]
    BadScheme(String),
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("{0} trailing bytes after final field")]
    TrailingBytes(usize),
}

const TAG_MODULE: u8 = 0x01;
const TAG_METHOD: u8 = 0x02;
const TAG_SCHEME: u8 = 0x03;
const TAG_HOST: u8 = 0x04;
const TAG_RAW_URI: u8 = 0x05;
const TAG_HEADER_COUNT: u8 = 0x06;
const TAG_HEADER_NAME: u8 = 0x07;
const TAG_HEADER_VALUE: u8 = 0x08;
// Present only when the dial target differs from the Host header.
const TAG_CONNECT_TO: u8 = 0x09;

/// Namespace for the encode/decode pair; the token itself travels as a
/// plain `String` inside payloads and findings.
pub struct PayloadToken;

impl PayloadToken {
    pub fn encode(payload: &BypassPayload) -> String {
        let mut buf = Vec::with_capacity(
            32 + payload.host.len()
                + payload.raw_uri.len()
                + payload.headers.iter().map(|h| h.name.len() + h.value.len() + 4).sum::<usize>(),
        );
        put_field(&mut buf, TAG_MODULE, payload.bypass_module.as_bytes());
        put_field(&mut buf, TAG_METHOD, payload.method.as_bytes());
        put_field(&mut buf, TAG_SCHEME, payload.scheme.as_str().as_bytes());
        put_field(&mut buf, TAG_HOST, payload.host.as_bytes());
        put_field(&mut buf, TAG_RAW_URI, payload.raw_uri.as_bytes());

        let mut count = Vec::with_capacity(4);
        put_varint(&mut count, payload.headers.len() as u64);
        put_field(&mut buf, TAG_HEADER_COUNT, &count);

        for h in &payload.headers {
            put_field(&mut buf, TAG_HEADER_NAME, h.name.as_bytes());
            put_field(&mut buf, TAG_HEADER_VALUE, h.value.as_bytes());
        }

        if let Some(connect) = &payload.connect_to {
            put_field(&mut buf, TAG_CONNECT_TO, connect.as_bytes());
        }

        URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn decode(token: &str) -> Result<BypassPayload, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::InvalidBase64)?;
        let mut cur = Cursor { buf: &raw, pos: 0 };

        let bypass_module = cur.take_string(TAG_MODULE, "module")?;
        let method = cur.take_string(TAG_METHOD, "method")?;
        let scheme_raw = cur.take_string(TAG_SCHEME, "scheme")?;
        let scheme = match scheme_raw.as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(TokenError::BadScheme(scheme_raw)),
        };
        let host = cur.take_string(TAG_HOST, "host")?;
        let raw_uri = cur.take_string(TAG_RAW_URI, "raw_uri")?;

        let count_bytes = cur.take_field(TAG_HEADER_COUNT, "header_count")?;
        let mut count_cur = Cursor { buf: count_bytes, pos: 0 };
        let count = count_cur.take_varint("header_count")?;

        let mut headers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let name = cur.take_string(TAG_HEADER_NAME, "header_name")?;
            let value = cur.take_string(TAG_HEADER_VALUE, "header_value")?;
            headers.push(Header { name, value });
        }

        let connect_to = if cur.pos < raw.len() {
            Some(cur.take_string(TAG_CONNECT_TO, "connect_to")?)
        } else {
            None
        };

        if cur.pos != raw.len() {
            return Err(TokenError::TrailingBytes(raw.len() - cur.pos));
        }

        let original_url = format!("{}://{}{}", scheme, host, raw_uri);
        Ok(BypassPayload {
            method,
            scheme,
            host,
            raw_uri,
            headers,
            connect_to,
            bypass_module,
            payload_token: token.to_string(),
            original_url,
        })
    }
}

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_field(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    buf.push(tag);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take_varint(&mut self, what: &'static str) -> Result<u64, TokenError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(TokenError::Truncated(what))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(TokenError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn take_field(&mut self, tag: u8, what: &'static str) -> Result<&'a [u8], TokenError> {
        let found = *self
            .buf
            .get(self.pos)
            .ok_or(TokenError::Truncated(what))?;
        if found != tag {
            return Err(TokenError::UnexpectedTag { expected: tag, found });
        }
        self.pos += 1;
        let len = self.take_varint(what)? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(TokenError::Truncated(what))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_string(&mut self, tag: u8, what: &'static str) -> Result<String, TokenError> {
        let bytes = self.take_field(tag, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TokenError::InvalidUtf8(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TargetUrl;

    fn sample() -> BypassPayload {
        let target = TargetUrl::parse("https://example.test:8443/admin/..;/?x=1").unwrap();
        let mut p = BypassPayload::from_target("http_headers_ip", &target);
        p.headers.push(Header::new("X-Forwarded-For", "127.0.0.1"));
        p.headers.push(Header::new("X-Forwarded-For", "10.0.0.1"));
        p.headers.push(Header::new("x-original-url", "/admin"));
        p
    }

    #[test]
    fn round_trip_equality() {
        let p = sample();
        let token = PayloadToken::encode(&p);
        let back = PayloadToken::decode(&token).unwrap();
        assert_eq!(back.method, p.method);
        assert_eq!(back.scheme, p.scheme);
        assert_eq!(back.host, p.host);
        assert_eq!(back.raw_uri, p.raw_uri);
        assert_eq!(back.headers, p.headers);
        assert_eq!(back.bypass_module, p.bypass_module);
    }

    #[test]
    fn re_encode_is_stable() {
        let token = PayloadToken::encode(&sample());
        let back = PayloadToken::decode(&token).unwrap();
        assert_eq!(PayloadToken::encode(&back), token);
    }

    #[test]
    fn url_safe_alphabet() {
        let token = PayloadToken::encode(&sample());
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }

    #[test]
    fn empty_headers_and_uri() {
        let target = TargetUrl::parse("http://h").unwrap();
        let p = BypassPayload::from_target("dumb_check", &target);
        let back = PayloadToken::decode(&PayloadToken::encode(&p)).unwrap();
        assert_eq!(back.raw_uri, "");
        assert!(back.headers.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            PayloadToken::decode("!!!not base64!!!"),
            Err(TokenError::InvalidBase64)
        );
    }

    #[test]
    fn rejects_wrong_tag_order() {
        // Hand-build: method field first instead of module.
        let mut raw = Vec::new();
        raw.push(0x02);
        raw.push(3);
        raw.extend_from_slice(b"GET");
        let token = URL_SAFE_NO_PAD.encode(&raw);
        assert!(matches!(
            PayloadToken::decode(&token),
            Err(TokenError::UnexpectedTag { expected: 0x01, found: 0x02 })
        ));
    }

    #[test]
    fn rejects_truncation() {
        let token = PayloadToken::encode(&sample());
        let raw = URL_SAFE_NO_PAD.decode(token.as_bytes()).unwrap();
        let cut = URL_SAFE_NO_PAD.encode(&raw[..raw.len() - 3]);
        assert!(PayloadToken::decode(&cut).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let token = PayloadToken::encode(&sample());
        let mut raw = URL_SAFE_NO_PAD.decode(token.as_bytes()).unwrap();
        raw.push(0xFF);
        let padded = URL_SAFE_NO_PAD.encode(&raw);
        // The stray byte is first tried as the optional dial-target tag.
        assert!(matches!(
            PayloadToken::decode(&padded),
            Err(TokenError::UnexpectedTag { expected: 0x09, found: 0xFF })
                | Err(TokenError::Truncated(_))
        ));
    }

    #[test]
    fn connect_override_round_trips() {
        let mut p = sample();
        p.connect_to = Some("203.0.113.9:8443".into());
        let back = PayloadToken::decode(&PayloadToken::encode(&p)).unwrap();
        assert_eq!(back.connect_to.as_deref(), Some("203.0.113.9:8443"));
    }
}
