use crate::config::{Config, ProxyConfig};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{strip_hop_headers, ConnectionPool, PoolConfig, PoolError};
use crate::registry::AppRepository;
use crate::rewrite::{base_path_script, inject_base_path, strip_prefix, BasePathInfo};
use crate::routes::RouteCache;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the mount prefix stripped from the path
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Upper bound on an upstream's upgrade response head
const UPGRADE_HEAD_LIMIT: usize = 16 * 1024;

/// Path under every app's mount that the proxy answers itself
const BASE_PATH_LOOKUP: &str = "/__appgate/base-path";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

struct ProxyState {
    registry: Arc<dyn AppRepository>,
    routes: Arc<RouteCache>,
    pool: ConnectionPool,
    config: ProxyConfig,
    request_timeout: Duration,
}

/// Path-prefix reverse proxy in front of the app containers
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        config: &Config,
        registry: Arc<dyn AppRepository>,
        routes: Arc<RouteCache>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let state = ProxyState {
            registry,
            routes,
            pool: ConnectionPool::new(PoolConfig::from(&config.server)),
            config: config.proxy.clone(),
            request_timeout: config.server.request_timeout(),
        };
        Self {
            bind_addr: config.server.proxy_bind,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener until shutdown is signalled
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            prefix = %self.state.config.path_prefix,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let (app_id, tail) = match strip_prefix(&path, &state.config.path_prefix) {
        Some((id, tail)) => (id.to_string(), tail.to_string()),
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::InvalidPath,
                "No app is mounted at this path",
            ))
        }
    };
    let base_path = state.config.base_path(&app_id);

    if tail.is_empty() {
        return Ok(redirect_to_slash(&base_path, req.uri().query()));
    }

    if tail == BASE_PATH_LOOKUP && req.method() == Method::GET {
        return Ok(base_path_lookup(&state, &app_id, base_path));
    }

    let port = match resolve_port(&state, &app_id) {
        Ok(port) => port,
        Err(response) => return Ok(response),
    };

    let upstream_path = match req.uri().query() {
        Some(query) => format!("{}?{}", tail, query),
        None => tail,
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&base_path) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }

    debug!(app = %app_id, method = %req.method(), upstream = %upstream_path, port, request_id = %request_id, "Proxying request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, state, app_id, port, upstream_path, request_id).await;
    }

    let inject = state.config.inject_base_path && req.method() != Method::HEAD;
    let script = base_path_script(&state.config.base_path_global, &base_path);
    let request_timeout = state.request_timeout;
    let max_rewrite = state.config.max_rewrite_bytes;

    let forwarded = tokio::time::timeout(request_timeout, async {
        let response = state.pool.send_request(req, port, &upstream_path).await?;
        finish_response(response, inject.then_some(script.as_str()), max_rewrite).await
    })
    .await;

    match forwarded {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(app = %app_id, port, error = %e, request_id = %request_id, "Failed to forward request");
            // The container may have died; re-read the registry next time
            state.routes.invalidate(&app_id);
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to app",
            ))
        }
        Err(_) => {
            warn!(
                app = %app_id,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Host port for a running app, from the route cache or the registry
fn resolve_port(state: &ProxyState, app_id: &str) -> Result<u16, ProxyResponse> {
    if let Some(port) = state.routes.get(app_id) {
        return Ok(port);
    }

    let generation = state.routes.generation();
    let record = state.registry.get(app_id).ok_or_else(|| {
        json_error_response(ProxyErrorCode::UnknownApp, "Unknown app")
    })?;

    match record.port {
        Some(port) if record.is_running() => {
            state.routes.fill(app_id, port, generation);
            Ok(port)
        }
        _ => Err(json_error_response(
            ProxyErrorCode::AppNotRunning,
            format!("App {} is not running", app_id),
        )),
    }
}

/// Identity and mount point of an app, answered without contacting it
fn base_path_lookup(state: &ProxyState, app_id: &str, base_path: String) -> ProxyResponse {
    let Some(record) = state.registry.get(app_id) else {
        return json_error_response(ProxyErrorCode::UnknownApp, "Unknown app");
    };

    let body = serde_json::json!({
        "success": true,
        "data": BasePathInfo::new(&record, base_path),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn redirect_to_slash(base_path: &str, query: Option<&str>) -> ProxyResponse {
    let location = match query {
        Some(q) => format!("{}/?{}", base_path, q),
        None => format!("{}/", base_path),
    };

    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(hyper::header::LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to read upstream body: {0}")]
    Body(#[from] hyper::Error),
}

/// Stream the upstream response through, or buffer and rewrite it if it is
/// an uncompressed HTML document and `script` is set.
///
/// At most `max_rewrite` bytes are buffered. A larger document is relayed
/// unmodified, starting with whatever was already read.
async fn finish_response(
    response: Response<Incoming>,
    script: Option<&str>,
    max_rewrite: usize,
) -> Result<ProxyResponse, ForwardError> {
    let rewrite = script.filter(|_| is_rewritable_html(&response));
    let (mut parts, mut body) = response.into_parts();
    strip_hop_headers(&mut parts.headers);

    let Some(script) = rewrite else {
        return Ok(Response::from_parts(parts, body.boxed()));
    };

    let declared = parts
        .headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_rewrite) {
        debug!(content_length = ?declared, max_rewrite, "HTML too large to rewrite");
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let mut original = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        original.extend_from_slice(&data);

        if original.len() > max_rewrite {
            debug!(max_rewrite, "HTML grew too large to rewrite");
            let head = futures::stream::iter(std::iter::once(Ok::<_, hyper::Error>(
                Frame::data(Bytes::from(original)),
            )));
            let relayed = StreamBody::new(head.chain(BodyStream::new(body)));
            return Ok(Response::from_parts(parts, BodyExt::boxed(relayed)));
        }
    }

    let rewritten = inject_base_path(&original, script);

    parts
        .headers
        .insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

    let body = Full::new(Bytes::from(rewritten))
        .map_err(|never| match never {})
        .boxed();
    Ok(Response::from_parts(parts, body))
}

fn is_rewritable_html(response: &Response<Incoming>) -> bool {
    if matches!(
        response.status(),
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    ) {
        return false;
    }

    let headers = response.headers();
    let is_html = headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false);

    let identity = headers
        .get(hyper::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("identity") || v.trim().is_empty())
        .unwrap_or(true);

    is_html && identity
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the container, with the rewritten path
fn build_upgrade_request(req: &Request<Incoming>, port: u16, path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parsed response head plus the offset where the body starts
struct UpgradeHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body_offset: usize,
}

fn parse_upgrade_response(data: &[u8]) -> Option<UpgradeHead> {
    let end = data.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&data[..end]).ok()?;
    let mut lines = head.split("\r\n");

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some(UpgradeHead {
        status,
        headers,
        body_offset: end + 4,
    })
}

async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= UPGRADE_HEAD_LIMIT {
            return Ok(buf);
        }
    }
}

/// Forward bytes bidirectionally between client and container connections
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    early_data: Vec<u8>,
    app_id: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(app = %app_id, request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                app = %app_id,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(app = %app_id, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    app_id: String,
    port: u16,
    upstream_path: String,
    request_id: String,
) -> Result<ProxyResponse, hyper::Error> {
    let raw_request = build_upgrade_request(&req, port, &upstream_path);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(app = %app_id, port, error = %e, "Failed to connect to app for upgrade");
            state.routes.invalidate(&app_id);
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to app",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(app = %app_id, error = %e, "Failed to send upgrade request to app");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let head = match tokio::time::timeout(state.request_timeout, read_upgrade_head(&mut backend_stream)).await {
        Ok(Ok(buf)) if !buf.is_empty() => buf,
        Ok(Ok(_)) => {
            error!(app = %app_id, "App closed connection before responding to upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "App closed connection",
            ));
        }
        Ok(Err(e)) => {
            error!(app = %app_id, error = %e, "Failed to read upgrade response from app");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to read app response",
            ));
        }
        Err(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                "App did not answer the upgrade request in time",
            ));
        }
    };

    let parsed = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(app = %app_id, "Failed to parse app upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from app",
            ));
        }
    };

    if parsed.status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app = %app_id, status = %parsed.status, "App rejected upgrade request");
        let mut response = Response::builder().status(parsed.status);
        for (name, value) in &parsed.headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let body = Bytes::copy_from_slice(&head[parsed.body_offset..]);
        return Ok(response
            .body(Full::new(body).map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| {
                json_error_response(ProxyErrorCode::InternalError, "Invalid app response")
            }));
    }

    debug!(app = %app_id, request_id = %request_id, "Upgrade accepted by app");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &parsed.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    let early_data = head[parsed.body_offset..].to_vec();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, early_data, &app_id, &request_id)
                    .await;
            }
            Err(e) => {
                error!(app = %app_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
