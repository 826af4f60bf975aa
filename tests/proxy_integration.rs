//! End-to-end pipeline tests over a real listener and a local echo
//! upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::Json;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use waf_proxy::config::Config;
use waf_proxy::ReverseProxy;

/// Minimal config pointing at one upstream.
fn base_config(upstream_url: &str) -> Config {
    let yaml = format!(
        r#"
upstreams:
  - name: app
    url: {upstream_url}
"#
    );
    serde_yaml::from_str(&yaml).expect("base config parses")
}

fn traversal_rule() -> waf_proxy::config::RuleConfig {
    serde_yaml::from_str(
        r#"
id: PT001
description: path traversal
target: path
pattern: '\.\./'
score: 10
"#,
    )
    .unwrap()
}

/// Upstream that echoes back the request path, body and the headers the
/// proxy is expected to manage.
async fn spawn_upstream() -> String {
    fn header(req: &Request, name: &str) -> String {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    let app = axum::Router::new().fallback(|req: Request| async move {
        let xff = header(&req, "x-forwarded-for");
        let xfp = header(&req, "x-forwarded-proto");
        let xfh = header(&req, "x-forwarded-host");
        let marker = header(&req, "x-waf-decision");
        let path = req.uri().path().to_string();

        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap_or_default();

        Json(json!({
            "path": path,
            "xff": xff,
            "xfp": xfp,
            "xfh": xfh,
            "marker": marker,
            "body": String::from_utf8_lossy(&body),
        }))
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_proxy(config: Config) -> SocketAddr {
    let proxy = Arc::new(ReverseProxy::new(&config).expect("proxy construction"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = proxy.app();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Raw HTTP/1.1 request helper. URL client libraries resolve dot
/// segments before the request leaves the machine, which would defeat
/// the traversal scenarios.
async fn raw_get(addr: SocketAddr, path: &str, extra_headers: &[(&str, &str)]) -> (u16, String, String) {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: test.local\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let (head, body) = text.split_once("\r\n\r\n").expect("response head");
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");

    (status, head.to_string(), body.to_string())
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (header_name, value) = line.split_once(':')?;
        if header_name.eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

#[tokio::test]
async fn traversal_request_is_blocked_with_contract_body() {
    let mut config = base_config("http://127.0.0.1:9"); // never reached
    config.rules = vec![traversal_rule()];
    let addr = spawn_proxy(config).await;

    let (status, head, body) = raw_get(addr, "/../etc/passwd", &[]).await;

    assert_eq!(status, 403);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("BLOCK"));
    assert_eq!(header_value(&head, "x-waf-score"), Some("10"));
    assert!(header_value(&head, "x-request-id").is_some());

    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(
        parsed,
        json!({"blocked": true, "reason": "waf", "score": 10, "rule_ids": ["PT001"]})
    );
}

#[tokio::test]
async fn encoded_traversal_is_blocked_too() {
    let mut config = base_config("http://127.0.0.1:9");
    config.rules = vec![traversal_rule()];
    let addr = spawn_proxy(config).await;

    let (status, head, _) = raw_get(addr, "/%2e%2e/etc/passwd", &[]).await;
    assert_eq!(status, 403);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("BLOCK"));
}

#[tokio::test]
async fn suspicious_user_agent_is_forwarded_with_markers() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(&upstream);
    config.rules = vec![serde_yaml::from_str(
        r#"
id: UA001
description: scanner user agent
target: header:user-agent
pattern: sqlmap
score: 6
"#,
    )
    .unwrap()];
    let addr = spawn_proxy(config).await;

    let (status, head, body) =
        raw_get(addr, "/search?q=test", &[("User-Agent", "sqlmap/1.7")]).await;

    assert_eq!(status, 200);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("SUSPICIOUS"));
    assert_eq!(header_value(&head, "x-waf-score"), Some("6"));

    // The upstream saw the marker header too.
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["marker"], "SUSPICIOUS");
}

#[tokio::test]
async fn rate_limit_fires_before_rule_evaluation() {
    let mut config = base_config("http://127.0.0.1:9");
    config.rate_limits.requests_per_minute = 3;
    // A rule that would 403 every request: admitted requests get 403,
    // the rate-limited one must get 429 instead, proving the limiter
    // runs first and sheds load before the engine.
    config.rules = vec![serde_yaml::from_str(
        r#"
id: ALL
description: match everything
target: path
pattern: '.'
score: 10
"#,
    )
    .unwrap()];
    let addr = spawn_proxy(config).await;

    for _ in 0..3 {
        let (status, _, _) = raw_get(addr, "/", &[]).await;
        assert_eq!(status, 403);
    }

    let (status, head, body) = raw_get(addr, "/", &[]).await;
    assert_eq!(status, 429);
    assert!(header_value(&head, "x-request-id").is_some());
    assert_eq!(header_value(&head, "x-waf-decision"), Some("ALLOW"));

    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["error"], "rate_limited");
}

#[tokio::test]
async fn untrusted_forwarded_for_is_ignored_and_replaced() {
    let upstream = spawn_upstream().await;
    let config = base_config(&upstream);
    let addr = spawn_proxy(config).await;

    let (status, _, body) =
        raw_get(addr, "/whoami", &[("X-Forwarded-For", "1.2.3.4")]).await;

    assert_eq!(status, 200);
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    // Peer is untrusted: the spoofed header is dropped and the outbound
    // chain carries only the transport peer.
    assert_eq!(parsed["xff"], "127.0.0.1");
    assert_eq!(parsed["xfh"], "test.local");
    assert_eq!(parsed["xfp"], "http");
}

#[tokio::test]
async fn trusted_forwarded_for_resolves_the_original_client() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(&upstream);
    config.trusted_proxies = vec!["127.0.0.0/8".to_string()];
    let addr = spawn_proxy(config).await;

    let (status, _, body) =
        raw_get(addr, "/whoami", &[("X-Forwarded-For", "1.2.3.4, 5.6.7.8")]).await;

    assert_eq!(status, 200);
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    // Left-most entry becomes the client; the chain keeps the inbound
    // value and appends the resolved client.
    assert_eq!(parsed["xff"], "1.2.3.4, 5.6.7.8, 1.2.3.4");
}

#[tokio::test]
async fn connect_failure_maps_to_502_and_connect_metric() {
    // Port 9 (discard) is closed: dial fails fast.
    let config = base_config("http://127.0.0.1:9");
    let addr = spawn_proxy(config).await;

    let (status, head, body) = raw_get(addr, "/", &[]).await;
    assert_eq!(status, 502);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("ALLOW"));
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["error"], "upstream_connect");

    let (status, _, metrics_body) = raw_get(addr, "/metrics", &[]).await;
    assert_eq!(status, 200);
    assert!(
        metrics_body.contains(r#"error_type="connect""#),
        "connect error not recorded in exposition"
    );
}

#[tokio::test]
async fn empty_pool_returns_502_without_blocking() {
    let mut config = base_config("http://127.0.0.1:9");
    // The only upstream is prefix-constrained away from this request.
    config.upstreams[0].path_prefixes = vec!["/api".to_string()];
    let addr = spawn_proxy(config).await;

    let (status, head, body) = raw_get(addr, "/other", &[]).await;
    assert_eq!(status, 502);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("ALLOW"));
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["error"], "no_upstream");
}

#[tokio::test]
async fn request_body_streams_through_to_upstream() {
    let upstream = spawn_upstream().await;
    let config = base_config(&upstream);
    let addr = spawn_proxy(config).await;

    let payload = "field=value&other=1";
    let request = format!(
        "POST /submit HTTP/1.1\r\nHost: test.local\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    let (head, body) = text.split_once("\r\n\r\n").unwrap();

    assert!(head.contains("200"));
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["body"], payload);
    assert_eq!(parsed["path"], "/submit");
}

#[tokio::test]
async fn oversized_declared_body_is_refused_before_forwarding() {
    let mut config = base_config("http://127.0.0.1:9");
    config.waf_settings.max_body_bytes = 16;
    let addr = spawn_proxy(config).await;

    let request = "POST /upload HTTP/1.1\r\nHost: test.local\r\nContent-Length: 1000000\r\nConnection: close\r\n\r\n";
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 413"));
    assert!(text.to_ascii_lowercase().contains("x-request-id"));
}

#[tokio::test]
async fn oversized_inspection_input_is_still_admissible() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(&upstream);
    config.waf_settings.max_inspect_bytes = 64;
    let addr = spawn_proxy(config).await;

    let long_query = format!("q={}", "x".repeat(500));
    let (status, head, _) = raw_get(addr, &format!("/search?{long_query}"), &[]).await;

    assert_eq!(status, 200);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("ALLOW"));
}

#[tokio::test]
async fn allowlisted_ip_bypasses_rules() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(&upstream);
    config.ip_allowlist = vec!["127.0.0.1".to_string()];
    config.rules = vec![traversal_rule()];
    let addr = spawn_proxy(config).await;

    let (status, head, _) = raw_get(addr, "/../etc/passwd", &[]).await;
    // The rule would block, but the allowlist gate wins.
    assert_ne!(status, 403);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("ALLOW"));
    assert_eq!(header_value(&head, "x-waf-score"), Some("0"));
}

#[tokio::test]
async fn blocklisted_ip_is_refused_with_synthetic_rule() {
    let mut config = base_config("http://127.0.0.1:9");
    config.ip_blocklist = vec!["127.0.0.1".to_string()];
    let addr = spawn_proxy(config).await;

    let (status, head, body) = raw_get(addr, "/", &[]).await;
    assert_eq!(status, 403);
    assert_eq!(header_value(&head, "x-waf-decision"), Some("BLOCK"));
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["rule_ids"], json!(["IPBL"]));
}

#[tokio::test]
async fn admin_endpoints_bypass_the_pipeline() {
    let mut config = base_config("http://127.0.0.1:9");
    // Rate limit of 1 rpm and a block-everything rule: admin endpoints
    // must not care about either.
    config.rate_limits.requests_per_minute = 1;
    config.rules = vec![serde_yaml::from_str(
        r#"
id: ALL
target: path
pattern: '.'
score: 100
"#,
    )
    .unwrap()];
    let addr = spawn_proxy(config).await;

    for _ in 0..5 {
        let (status, _, body) = raw_get(addr, "/healthz", &[]).await;
        assert_eq!(status, 200);
        let parsed: Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(parsed["status"], "healthy");
    }

    let (status, _, body) = raw_get(addr, "/readyz", &[]).await;
    assert_eq!(status, 200);
    let parsed: Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(parsed["status"], "ready");

    let (status, _, _) = raw_get(addr, "/metrics", &[]).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn duplicate_rule_ids_refuse_startup() {
    let mut config = base_config("http://127.0.0.1:9");
    let rule = traversal_rule();
    config.rules = vec![rule.clone(), rule];

    let err = ReverseProxy::new(&config).unwrap_err();
    assert!(err.is_config_fatal());
}
