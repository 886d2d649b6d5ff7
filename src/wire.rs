//! Out-of-band datagram codec: `getinfo`/`infoResponse` and
//! `getservers`/`getserversResponse` framing.
//!
//! All four message shapes share the `\xFF\xFF\xFF\xFF` out-of-band prefix
//! used by the Quake III engine family. Payload bytes are decoded as Latin-1
//! (lossy) since the protocol permits high bytes in server names.

use encoding::all::ISO_8859_1;
use encoding::{DecoderTrap, Encoding};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::registry::Endpoint;

/// The 4-byte connectionless prefix every datagram in this protocol starts with.
pub const OOB_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// `getserversResponse` header length: 4-byte prefix + the response literal
/// (`"getserversResponse"`, 18 bytes). The source's upstream-sync parser
/// skips a fixed 24 bytes regardless of the actual literal length — a
/// quirk of the original that would desync this codec's own encode/decode
/// round-trip if copied verbatim, so this implementation instead derives
/// the skip from the literal it actually writes (see DESIGN.md).
const GETSERVERS_RESPONSE_LITERAL: &[u8] = b"getserversResponse";
const GETSERVERS_RESPONSE_HEADER_LEN: usize = OOB_PREFIX.len() + GETSERVERS_RESPONSE_LITERAL.len();

/// Sentinel terminating a `getserversResponse` payload.
const GETSERVERS_RESPONSE_TRAILER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Fixed fallback version string for protocol-84 servers that omit `version`.
pub const PROTOCOL_84_FALLBACK_VERSION: &str = "ET 2.60b linux-i386 May 8 2006";

/// Decoded `infoResponse` key-value bag, plus the record fields projected
/// out of it by `crate::registry`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoResponse {
    pub fields: HashMap<String, String>,
}

impl InfoResponse {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Applies the version synthesis rule: missing or empty `version` with
    /// `protocol == "84"` synthesizes the fixed ET 2.60b string; missing or
    /// empty `version` otherwise falls back to `"Unknown"`. This rule is
    /// protocol-specific and intentionally not generalized.
    pub fn version(&self) -> String {
        match self.get("version") {
            Some(v) if !v.is_empty() => v.to_owned(),
            _ if self.get("protocol") == Some("84") => PROTOCOL_84_FALLBACK_VERSION.to_owned(),
            _ => "Unknown".to_owned(),
        }
    }
}

/// Decodes a byte slice as Latin-1 (ISO-8859-1), replacing undecodable
/// sequences rather than failing. ISO-8859-1 maps every byte to a codepoint,
/// so this never actually hits the replacement path, but the trait requires
/// a trap.
pub(crate) fn decode_latin1_lossy(bytes: &[u8]) -> String {
    ISO_8859_1
        .decode(bytes, DecoderTrap::Replace)
        .unwrap_or_default()
}

/// Builds the `getinfo` probe datagram: prefix + literal `getinfo 0`. The
/// challenge token is fixed at `0` since this system ignores the echoed
/// value on the reply path.
pub fn build_getinfo() -> Vec<u8> {
    let mut buf = Vec::with_capacity(OOB_PREFIX.len() + 9);
    buf.extend_from_slice(&OOB_PREFIX);
    buf.extend_from_slice(b"getinfo 0");
    buf
}

/// Parses an `infoResponse` datagram. Returns `None` if the decoded payload
/// does not contain the `infoResponse` marker.
pub fn parse_info_response(buf: &[u8]) -> Option<InfoResponse> {
    let text = decode_latin1_lossy(buf);
    let marker_pos = text.find("infoResponse")?;
    let rest = &text[marker_pos + "infoResponse".len()..];

    // The byte right after the marker (typically `\n`) precedes the first
    // `\`; drop that leading segment rather than the marker's own split
    // tokens. Empty tokens are kept, not filtered, so a key with an empty
    // value (e.g. `\version\\protocol\84`) still lands as `version=""`.
    let mut tokens = rest.split('\\');
    tokens.next();
    let mut fields = HashMap::new();
    loop {
        let Some(key) = tokens.next() else { break };
        let Some(value) = tokens.next() else {
            // Trailing lone key with no paired value: dropped per the wire format.
            break;
        };
        fields.insert(key.to_owned(), value.to_owned());
    }
    Some(InfoResponse { fields })
}

/// Builds a `getservers <protocol> empty full` request datagram.
pub fn build_getservers_request(protocol: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&OOB_PREFIX);
    buf.extend_from_slice(format!("getservers {protocol} empty full").as_bytes());
    buf
}

/// Encodes a `getserversResponse` reply: header literal followed by one
/// 6-byte big-endian `(ipv4, port)` slot per endpoint, terminated by a
/// trailing `FF FF FF FF` sentinel.
pub fn encode_getservers_response(endpoints: &[Endpoint]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(GETSERVERS_RESPONSE_HEADER_LEN + endpoints.len() * 6 + 4);
    buf.extend_from_slice(&OOB_PREFIX);
    buf.extend_from_slice(GETSERVERS_RESPONSE_LITERAL);
    for endpoint in endpoints {
        buf.extend_from_slice(&endpoint.ip.octets());
        buf.extend_from_slice(&endpoint.port.to_be_bytes());
    }
    buf.extend_from_slice(&GETSERVERS_RESPONSE_TRAILER);
    buf
}

/// Parses a `getserversResponse` payload into the set of endpoints it
/// carries. Tolerates a trailing slot shorter than 6 bytes (the `FF FF FF
/// FF` sentinel landing on a slot boundary) by skipping it rather than
/// erroring.
pub fn parse_getservers_response(buf: &[u8]) -> Vec<Endpoint> {
    if buf.len() <= GETSERVERS_RESPONSE_HEADER_LEN {
        return Vec::new();
    }
    let body = &buf[GETSERVERS_RESPONSE_HEADER_LEN..];

    let mut endpoints = Vec::new();
    for slot in body.chunks(6) {
        if slot.len() < 6 {
            break;
        }
        let ip = Ipv4Addr::new(slot[0], slot[1], slot[2], slot[3]);
        let port = u16::from_be_bytes([slot[4], slot[5]]);
        endpoints.push(Endpoint { ip, port });
    }
    endpoints
}
