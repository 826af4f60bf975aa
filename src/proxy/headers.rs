//! Hop-by-hop header hygiene and `X-Forwarded-*` synthesis.

use std::collections::HashSet;
use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers that apply to a single transport connection and must never
/// cross the proxy boundary, in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Names listed in the Connection header are hop-by-hop too.
fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for value in headers.get_all("connection") {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    tokens.insert(token);
                }
            }
        }
    }
    tokens
}

/// Filter inbound request headers for upstream forwarding.
///
/// Drops the hop-by-hop set, anything the Connection header names, and
/// `host`/`content-length` (the outbound client re-derives both from
/// the target URL and the streamed body).
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed = connection_tokens(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name) || connection_listed.contains(name.as_str()) {
            continue;
        }
        if name.as_str() == "host" || name.as_str() == "content-length" {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}

/// Filter upstream response headers before relaying to the client.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed = connection_tokens(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name) || connection_listed.contains(name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}

/// Add the forwarding headers to an outbound request.
///
/// An inbound `X-Forwarded-For` is only honored when it arrived over a
/// trusted peer; otherwise it is dropped before the resolved client IP
/// is appended, so an untrusted client cannot smuggle identities past
/// the proxy.
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    peer_trusted: bool,
    scheme: &str,
    original_host: Option<&str>,
) {
    let client = client_ip.to_string();

    let xff = if peer_trusted {
        match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {client}"),
            None => client,
        }
    } else {
        client
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", value);
    }

    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert("x-forwarded-proto", value);
    }

    if let Some(host) = original_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                value.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let filtered = filter_request_headers(&headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("te", "trailers"),
            ("accept", "text/html"),
            ("cookie", "a=1"),
        ]));

        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("keep-alive").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("upgrade").is_none());
        assert!(filtered.get("te").is_none());
        assert_eq!(filtered.get("accept").unwrap(), "text/html");
        assert_eq!(filtered.get("cookie").unwrap(), "a=1");
    }

    #[test]
    fn strips_connection_listed_headers() {
        let filtered = filter_request_headers(&headers(&[
            ("connection", "close, X-Custom-Session"),
            ("x-custom-session", "abc"),
            ("accept", "*/*"),
        ]));

        assert!(filtered.get("x-custom-session").is_none());
        assert!(filtered.get("accept").is_some());
    }

    #[test]
    fn drops_host_and_content_length_outbound() {
        let filtered = filter_request_headers(&headers(&[
            ("host", "example.com"),
            ("content-length", "42"),
            ("content-type", "application/json"),
        ]));

        assert!(filtered.get("host").is_none());
        assert!(filtered.get("content-length").is_none());
        assert!(filtered.get("content-type").is_some());
    }

    #[test]
    fn response_filtering_preserves_ordinary_headers() {
        let filtered = filter_response_headers(&headers(&[
            ("connection", "keep-alive"),
            ("content-type", "text/plain"),
            ("x-upstream", "app-1"),
        ]));

        assert!(filtered.get("connection").is_none());
        assert_eq!(filtered.get("content-type").unwrap(), "text/plain");
        assert_eq!(filtered.get("x-upstream").unwrap(), "app-1");
    }

    #[test]
    fn untrusted_inbound_forwarded_for_is_replaced() {
        let mut map = headers(&[("x-forwarded-for", "1.2.3.4")]);
        apply_forwarding_headers(
            &mut map,
            "8.8.8.8".parse().unwrap(),
            false,
            "http",
            Some("example.com"),
        );

        assert_eq!(map.get("x-forwarded-for").unwrap(), "8.8.8.8");
        assert_eq!(map.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(map.get("x-forwarded-host").unwrap(), "example.com");
    }

    #[test]
    fn trusted_inbound_forwarded_for_is_appended_to() {
        let mut map = headers(&[("x-forwarded-for", "1.2.3.4")]);
        apply_forwarding_headers(
            &mut map,
            "1.2.3.4".parse().unwrap(),
            true,
            "http",
            None,
        );

        assert_eq!(map.get("x-forwarded-for").unwrap(), "1.2.3.4, 1.2.3.4");
        assert!(map.get("x-forwarded-host").is_none());
    }
}
