//! TLS ClientHello detection and SNI location.
//!
//! The walker follows the ClientHello wire format:
//! record header (5) → handshake header (4) → version + random (34) →
//! session id → cipher suites → compression methods → extensions.
//! Every length prefix is bounds-checked; any failure yields `None`.

use crate::config;

pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
pub const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Byte range of the SNI hostname inside a TCP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniLocation {
    pub offset: usize,
    pub len: usize,
}

impl SniLocation {
    /// Split point in the middle of the hostname bytes.
    pub fn midpoint(&self) -> usize {
        self.offset + self.len / 2
    }
}

/// Cheap ClientHello check: handshake record carrying handshake type 1.
pub fn is_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 7
        && payload[0] == CONTENT_TYPE_HANDSHAKE
        && payload[5] == HANDSHAKE_CLIENT_HELLO
}

/// Locate the first `host_name` entry of the server_name extension.
pub fn find_sni(payload: &[u8]) -> Option<SniLocation> {
    if payload.len() < 9 || payload[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let record_len = be16(payload, 3)? as usize;
    let record_end = (5 + record_len).min(payload.len());

    let hs = 5;
    if hs + 4 > record_end || payload[hs] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hello_len = ((payload[hs + 1] as usize) << 16)
        | ((payload[hs + 2] as usize) << 8)
        | payload[hs + 3] as usize;
    let hello_end = (hs + 4 + hello_len).min(record_end);

    let mut p = hs + 4;
    // client_version + random
    p = skip(p, 34, hello_end)?;
    // session_id
    let sid = *payload.get(p)? as usize;
    p = skip(p + 1, sid, hello_end)?;
    // cipher_suites
    let suites = be16(payload, p)? as usize;
    p = skip(p + 2, suites, hello_end)?;
    // compression_methods
    let comp = *payload.get(p)? as usize;
    p = skip(p + 1, comp, hello_end)?;
    // extensions
    let ext_total = be16(payload, p)? as usize;
    p += 2;
    let ext_end = (p + ext_total).min(hello_end);

    while p + 4 <= ext_end {
        let ext_type = be16(payload, p)?;
        let ext_len = be16(payload, p + 2)? as usize;
        p += 4;
        if p + ext_len > ext_end {
            return None;
        }
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(payload, p, p + ext_len);
        }
        p += ext_len;
    }
    None
}

fn parse_server_name(payload: &[u8], start: usize, end: usize) -> Option<SniLocation> {
    let list_len = be16(payload, start)? as usize;
    let list_end = (start + 2 + list_len).min(end);
    let mut p = start + 2;
    while p + 3 <= list_end {
        let name_type = payload[p];
        let name_len = be16(payload, p + 1)? as usize;
        p += 3;
        if p + name_len > list_end {
            return None;
        }
        if name_type == NAME_TYPE_HOST && name_len > 0 {
            return Some(SniLocation {
                offset: p,
                len: name_len,
            });
        }
        p += name_len;
    }
    None
}

/// Split offset in the middle of the SNI hostname, strictly inside the payload.
pub fn sni_split_offset(payload: &[u8]) -> Option<usize> {
    let sni = find_sni(payload)?;
    let mid = sni.midpoint();
    (sni.len >= 2 && mid > 0 && mid < payload.len()).then_some(mid)
}

/// Hostname carried in the SNI extension, if it is valid UTF-8.
pub fn server_name(payload: &[u8]) -> Option<&str> {
    let sni = find_sni(payload)?;
    std::str::from_utf8(payload.get(sni.offset..sni.offset + sni.len)?).ok()
}

/// Offset of an HTTP `Host:` header (case-insensitive) at the payload start
/// or right after a CRLF, within the first kilobyte.
pub fn find_http_host(payload: &[u8]) -> Option<usize> {
    let span = &payload[..payload.len().min(config::HTTP_HOST_SEARCH_LIMIT)];
    if starts_with_host(span, 0) {
        return Some(0);
    }
    (0..span.len().saturating_sub(1))
        .filter(|&i| span[i] == b'\r' && span[i + 1] == b'\n')
        .map(|i| i + 2)
        .find(|&at| starts_with_host(span, at))
}

fn starts_with_host(span: &[u8], at: usize) -> bool {
    span.get(at..at + 5)
        .is_some_and(|w| w[..4].eq_ignore_ascii_case(b"host") && w[4] == b':')
}

fn skip(p: usize, n: usize, end: usize) -> Option<usize> {
    let next = p.checked_add(n)?;
    (next <= end).then_some(next)
}

fn be16(data: &[u8], at: usize) -> Option<u16> {
    let b = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}
