//! Request normalization and client identity resolution.
//!
//! Everything the rule engine sees goes through this module first: the
//! path and query are percent-decoded exactly once, a fixed header
//! subset is canonicalized, and all inspected strings are truncated to
//! the configured byte budget.

use std::collections::HashMap;
use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Header names the rule engine may reference, stored lower-cased.
pub const INSPECTED_HEADERS: [&str; 5] =
    ["host", "user-agent", "referer", "cookie", "content-type"];

/// Percent-decode a string once. Invalid escapes are passed through
/// literally; decoded bytes go through lossy UTF-8 so a stray high byte
/// cannot make inspection fail.
pub fn percent_decode_once(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(&h), Some(&l)) = (bytes.get(i + 1), bytes.get(i + 2)) {
                if let (Some(hi), Some(lo)) = (hex_val(h), hex_val(l)) {
                    out.push(hi * 16 + lo);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode the raw path into the form rules inspect: one decode pass,
/// backslashes folded to slashes, NUL bytes stripped.
pub fn decode_path(raw: &str) -> String {
    let decoded = percent_decode_once(raw);
    decoded
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '\\' { '/' } else { c })
        .collect()
}

/// Canonicalize a decoded path for routing and logging: collapse
/// repeated slashes, resolve `.` and `..` segments. A path that would
/// resolve above root is returned unchanged so traversal attempts stay
/// detectable downstream.
pub fn normalize_path(decoded: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return decoded.to_string();
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Decode the query once, preserving parameter order and repetition.
/// Rules may depend on order (e.g. `UNION.*SELECT`), so nothing is
/// re-sorted.
pub fn normalize_query(raw: &str) -> String {
    percent_decode_once(raw)
        .chars()
        .filter(|&c| c != '\0')
        .collect()
}

/// Extract the canonical header subset with lower-cased keys.
pub fn extract_header_subset(headers: &HeaderMap) -> HashMap<String, String> {
    let mut subset = HashMap::with_capacity(INSPECTED_HEADERS.len());
    for name in INSPECTED_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            subset.insert(name.to_string(), value.to_string());
        }
    }
    subset
}

/// Resolve the client identity under the trusted-proxy model.
///
/// If the transport peer falls inside a trusted CIDR, the left-most
/// entry of `X-Forwarded-For` that parses as an IP wins; otherwise, and
/// on any malformed header, the peer address itself is the client.
/// Returns the resolved IP and whether the peer was trusted.
pub fn resolve_client_ip(
    peer: IpAddr,
    trusted_proxies: &[IpNet],
    forwarded_for: Option<&str>,
) -> (IpAddr, bool) {
    let peer_trusted = trusted_proxies.iter().any(|net| net.contains(&peer));
    if !peer_trusted {
        return (peer, false);
    }

    if let Some(xff) = forwarded_for {
        for entry in xff.split(',') {
            if let Ok(ip) = entry.trim().parse::<IpAddr>() {
                return (ip, true);
            }
        }
    }

    (peer, true)
}

/// Truncate an inspected string to the byte budget, never splitting a
/// UTF-8 code point.
pub fn truncate_inspect(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
