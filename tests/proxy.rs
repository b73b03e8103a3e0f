//! Reverse proxy integration tests with raw TCP upstreams

use appgate::config::Config;
use appgate::proxy::ProxyServer;
use appgate::registry::{AppKind, AppRecord, AppRepository, AppSource, AppStatus, JsonFileRegistry};
use appgate::routes::RouteCache;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// One-response-per-connection upstream that records the request heads it saw
struct Upstream {
    port: u16,
    hits: Arc<AtomicUsize>,
    requests: mpsc::UnboundedReceiver<String>,
}

async fn spawn_upstream(response: Vec<u8>) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, requests) = mpsc::unbounded_channel();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let _ = tx.send(head);
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Upstream {
        port,
        hits,
        requests,
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Upstream that answers every request with its own body, and reports the
/// head plus body it received
async fn spawn_echo_upstream() -> (u16, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let split = loop {
                    if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break i + 4;
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                };

                let head = String::from_utf8_lossy(&buf[..split]).to_string();
                let length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);

                let mut body = buf[split..].to_vec();
                while body.len() < length {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => body.extend_from_slice(&chunk[..n]),
                    }
                }

                let response = http_response("text/plain", "", &body);
                let _ = tx.send((head, body));
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (port, rx)
}

fn http_response(content_type: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        content_type,
        body.len(),
        extra_headers
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn record(id: &str, status: AppStatus, port: Option<u16>) -> AppRecord {
    let now = Utc::now();
    AppRecord {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        source: AppSource::Archive,
        source_url: None,
        source_branch: None,
        status,
        container_id: port.map(|_| "abc123".to_string()),
        port,
        kind: AppKind::Node,
        image: "node:20-alpine".to_string(),
        build_command: "npm install".to_string(),
        start_command: "npm start".to_string(),
        environment_vars: BTreeMap::new(),
        path: PathBuf::from("/tmp/unused"),
        created_at: now,
        updated_at: now,
    }
}

struct TestProxy {
    addr: SocketAddr,
    registry: Arc<dyn AppRepository>,
    routes: Arc<RouteCache>,
    _dir: tempfile::TempDir,
    _shutdown: watch::Sender<bool>,
}

async fn start_proxy(records: Vec<AppRecord>) -> TestProxy {
    start_proxy_with(records, |_| {}).await
}

async fn start_proxy_with(records: Vec<AppRecord>, configure: impl FnOnce(&mut Config)) -> TestProxy {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    configure(&mut config);

    let registry: Arc<dyn AppRepository> =
        Arc::new(JsonFileRegistry::open(config.storage.registry_path()).unwrap());
    for record in records {
        registry.upsert(record).unwrap();
    }
    let routes = Arc::new(RouteCache::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let proxy = ProxyServer::new(&config, Arc::clone(&registry), Arc::clone(&routes), shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.run_with_listener(listener).await;
    });

    TestProxy {
        addr,
        registry,
        routes,
        _dir: dir,
        _shutdown: shutdown_tx,
    }
}

struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send one request with `Connection: close` and read the whole response
async fn send(addr: SocketAddr, method: &str, path: &str) -> RawResponse {
    send_with_body(addr, method, path, b"").await
}

async fn send_with_body(addr: SocketAddr, method: &str, path: &str, body: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let length = if body.is_empty() {
        String::new()
    } else {
        format!("Content-Length: {}\r\n", body.len())
    };
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: example.test\r\n{}Connection: close\r\n\r\n",
        method, path, length
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .expect("response within timeout")
        .unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    RawResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

#[tokio::test]
async fn test_stopped_app_is_not_proxied() {
    let upstream = spawn_upstream(http_response("text/plain", "", b"hello")).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Stopped, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/some/path").await;
    assert_eq!(response.status, 503);
    assert_eq!(response.header("x-proxy-error"), Some("APP_NOT_RUNNING"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_app_and_invalid_path() {
    let proxy = start_proxy(vec![]).await;

    let response = send(proxy.addr, "GET", "/apps/missing/").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("UNKNOWN_APP"));

    let response = send(proxy.addr, "GET", "/elsewhere").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("INVALID_PATH"));
}

#[tokio::test]
async fn test_html_response_gets_base_path_script() {
    let html = b"<html><head></head><body>X</body></html>";
    let upstream = spawn_upstream(http_response("text/html; charset=utf-8", "", html)).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 200);

    let body = String::from_utf8(response.body.clone()).unwrap();
    assert_eq!(
        body,
        r#"<html><head><script>window.__APP_BASE_PATH__="/apps/demo";</script></head><body>X</body></html>"#
    );
    let content_length: usize = response.header("content-length").unwrap().parse().unwrap();
    assert_eq!(content_length, response.body.len());
}

#[tokio::test]
async fn test_injection_can_be_disabled() {
    let html = b"<html><head></head><body>X</body></html>";
    let upstream = spawn_upstream(http_response("text/html", "", html)).await;
    let proxy = start_proxy_with(
        vec![record("demo", AppStatus::Running, Some(upstream.port))],
        |config| config.proxy.inject_base_path = false,
    )
    .await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.body, html.to_vec());
}

#[tokio::test]
async fn test_compressed_html_passes_through() {
    let body = b"\x1f\x8b\x08\x00not-really-gzip";
    let upstream = spawn_upstream(http_response("text/html", "Content-Encoding: gzip\r\n", body)).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, body.to_vec());
}

#[tokio::test]
async fn test_path_is_rewritten_and_forwarding_headers_set() {
    let mut upstream = spawn_upstream(http_response("application/json", "", br#"{"ok":true}"#)).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/api/items?page=2").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, br#"{"ok":true}"#.to_vec());

    let head = upstream.requests.recv().await.unwrap();
    let lower = head.to_ascii_lowercase();
    assert!(head.starts_with("GET /api/items?page=2 HTTP/1.1\r\n"), "{}", head);
    assert!(lower.contains("x-forwarded-prefix: /apps/demo\r\n"), "{}", head);
    assert!(lower.contains("x-forwarded-host: example.test\r\n"), "{}", head);
    assert!(lower.contains("x-forwarded-proto: http\r\n"), "{}", head);
    assert!(lower.contains("x-forwarded-for: 127.0.0.1\r\n"), "{}", head);
    assert!(lower.contains("x-request-id: "), "{}", head);
    assert!(lower.contains(&format!("host: 127.0.0.1:{}\r\n", upstream.port)), "{}", head);
}

#[tokio::test]
async fn test_missing_trailing_slash_redirects() {
    let upstream = spawn_upstream(http_response("text/plain", "", b"hi")).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo?tab=1").await;
    assert_eq!(response.status, 308);
    assert_eq!(response.header("location"), Some("/apps/demo/?tab=1"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dead_upstream_returns_bad_gateway_and_drops_route() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-proxy-error"), Some("CONNECTION_FAILED"));
    assert!(proxy.routes.get("demo").is_none());
}

#[tokio::test]
async fn test_route_cache_follows_registry_after_invalidation() {
    let upstream = spawn_upstream(http_response("text/plain", "", b"hi")).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 200);
    assert_eq!(proxy.routes.get("demo"), Some(upstream.port));

    // What a lifecycle stop does
    let mut stopped = proxy.registry.get("demo").unwrap();
    stopped.status = AppStatus::Stopped;
    proxy.registry.upsert(stopped).unwrap();
    proxy.routes.invalidate("demo");

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 503);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_base_path_lookup_is_served_by_proxy() {
    let upstream = spawn_upstream(http_response("text/plain", "", b"hi")).await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Stopped, Some(upstream.port))]).await;

    let response = send(proxy.addr, "GET", "/apps/demo/__appgate/base-path").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], "demo");
    assert_eq!(body["data"]["basePath"], "/apps/demo");
    assert_eq!(body["data"]["running"], false);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    let response = send(proxy.addr, "GET", "/apps/missing/__appgate/base-path").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-proxy-error"), Some("UNKNOWN_APP"));
}

#[tokio::test]
async fn test_request_body_is_forwarded() {
    let (port, mut received) = spawn_echo_upstream().await;
    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(port))]).await;

    let response = send_with_body(proxy.addr, "POST", "/apps/demo/submit", b"hello").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello".to_vec());

    let (head, body) = received.recv().await.unwrap();
    assert!(head.starts_with("POST /submit HTTP/1.1\r\n"), "{}", head);
    assert!(head.to_ascii_lowercase().contains("content-length: 5\r\n"), "{}", head);
    assert_eq!(body, b"hello".to_vec());
}

#[tokio::test]
async fn test_oversized_html_passes_through_unmodified() {
    let html = format!("<html><head></head><body>{}</body></html>", "x".repeat(256));
    let upstream = spawn_upstream(http_response("text/html", "", html.as_bytes())).await;
    let proxy = start_proxy_with(
        vec![record("demo", AppStatus::Running, Some(upstream.port))],
        |config| config.proxy.max_rewrite_bytes = 64,
    )
    .await;

    let response = send(proxy.addr, "GET", "/apps/demo/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, html.as_bytes().to_vec());
}

#[tokio::test]
async fn test_websocket_upgrade_is_tunnelled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let head = read_head(&mut stream).await;
        let _ = head_tx.send(head);

        // Bytes sent right after the 101 must reach the client too
        let switching = b"HTTP/1.1 101 Switching Protocols\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n\r\nEARLY";
        if stream.write_all(switching).await.is_err() {
            return;
        }

        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let proxy = start_proxy(vec![record("demo", AppStatus::Running, Some(port))]).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(
            b"GET /apps/demo/ws HTTP/1.1\r\nHost: example.test\r\n\
              Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(10), async {
        while !buf.windows(5).any(|w| w == b"EARLY") {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("upgrade response within timeout");

    let text = String::from_utf8_lossy(&buf).to_string();
    assert!(text.starts_with("HTTP/1.1 101"), "{}", text);
    assert!(text.ends_with("\r\n\r\nEARLY"), "{}", text);

    let head = head_rx.recv().await.unwrap();
    assert!(head.starts_with("GET /ws HTTP/1.1\r\n"), "{}", head);

    client.write_all(b"ping!").await.unwrap();
    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(&echoed, b"ping!");
}
