//! Management API
//!
//! JSON over HTTP for provisioning and controlling apps. Every response uses
//! the `{success, data?, error?}` envelope. All routes except `/health`,
//! `/version` and the per-app base-path lookup require a bearer token.

use crate::error::AppError;
use crate::lifecycle::{check_id, AppManager, GitSource};
use crate::registry::AppRecord;
use crate::rewrite::BasePathInfo;
use crate::settings::{RuntimeSettings, SettingsStore};
use anyhow::Result;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 5000;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            code: None,
        }
    }
}

/// Create app from git request body
#[derive(Debug, Deserialize)]
pub struct CreateFromGitRequest {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Runtime settings update. An omitted password keeps the stored one; an
/// empty string clears it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub use_sudo: bool,
    #[serde(default)]
    pub sudo_password: Option<String>,
}

impl UpdateSettingsRequest {
    fn apply(self, current: RuntimeSettings) -> RuntimeSettings {
        let sudo_password = match self.sudo_password {
            None => current.sudo_password,
            Some(p) if p.is_empty() => None,
            Some(p) => Some(p),
        };
        RuntimeSettings {
            use_sudo: self.use_sudo,
            sudo_password,
        }
    }
}

#[derive(Debug, Serialize)]
struct LogsBody {
    id: String,
    tail: usize,
    logs: String,
}

/// App management API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    manager: Arc<AppManager>,
    settings: Arc<SettingsStore>,
    auth_token: String,
    max_upload_bytes: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<AppManager>,
        settings: Arc<SettingsStore>,
        auth_token: String,
        max_upload_bytes: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            settings,
            auth_token,
            max_upload_bytes,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth(&self, req: &Request<Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .map(|token| token.trim() == self.auth_token)
            .unwrap_or(false)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version.to_string()));
        }

        // Apps call this from the browser to learn their mount point
        if method == Method::GET {
            if let Some((id, Some("base-path"))) = app_route(&path) {
                return Ok(self.base_path(id));
            }
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
        }

        let response = match (method, path.as_str()) {
            (Method::GET, "/api/apps") => {
                ok_json(StatusCode::OK, ApiResponse::ok(self.manager.list()))
            }
            (Method::POST, "/api/apps/git") => self.create_from_git(req).await,
            (Method::POST, "/api/apps/archive") => self.create_from_archive(req).await,
            (Method::GET, "/api/settings/runtime") => ok_json(
                StatusCode::OK,
                ApiResponse::ok(self.settings.load().redacted()),
            ),
            (Method::PUT, "/api/settings/runtime") => self.update_settings(req).await,
            (method, path) => match app_route(path) {
                Some((id, action)) => {
                    let query = req.uri().query().map(str::to_string);
                    self.app_action(method, id, action, query.as_deref()).await
                }
                None => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
            },
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            )
        }))
    }

    async fn app_action(
        &self,
        method: Method,
        id: &str,
        action: Option<&str>,
        query: Option<&str>,
    ) -> Result<Response<Full<Bytes>>> {
        if let Err(e) = check_id(id) {
            return app_error(e);
        }

        let result = match (method, action) {
            (Method::GET, None) => self.manager.get(id),
            (Method::DELETE, None) => {
                return match self.manager.delete(id).await {
                    Ok(()) => ok_json(
                        StatusCode::OK,
                        ApiResponse::ok(serde_json::json!({ "id": id, "deleted": true })),
                    ),
                    Err(e) => app_error(e),
                };
            }
            (Method::POST, Some("start")) => self.manager.start(id).await,
            (Method::POST, Some("stop")) => self.manager.stop(id).await,
            (Method::POST, Some("restart")) => self.manager.restart(id).await,
            (Method::POST, Some("update")) => self.manager.update(id).await,
            (Method::GET, Some("logs")) => {
                let tail = log_tail(query);
                return match self.manager.logs(id, tail).await {
                    Ok(logs) => ok_json(
                        StatusCode::OK,
                        ApiResponse::ok(LogsBody {
                            id: id.to_string(),
                            tail,
                            logs,
                        }),
                    ),
                    Err(e) => app_error(e),
                };
            }
            _ => return Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        };

        record_response(StatusCode::OK, result)
    }

    async fn create_from_git(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = match self.read_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let create_req: CreateFromGitRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid request: {}", e),
                ))
            }
        };

        let result = self
            .manager
            .create_from_git(GitSource {
                url: create_req.url,
                branch: create_req.branch,
                env: create_req.env,
            })
            .await;
        record_response(StatusCode::CREATED, result)
    }

    async fn create_from_archive(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = match self.read_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let result = self.manager.create_from_archive(body).await;
        record_response(StatusCode::CREATED, result)
    }

    async fn update_settings(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = match self.read_body(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let update: UpdateSettingsRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid request: {}", e),
                ))
            }
        };

        let settings = update.apply(self.settings.load());
        self.settings.save(&settings)?;
        info!(use_sudo = settings.use_sudo, "Runtime settings updated");

        ok_json(StatusCode::OK, ApiResponse::ok(settings.redacted()))
    }

    fn base_path(&self, id: &str) -> Response<Full<Bytes>> {
        let record = match check_id(id).and_then(|()| self.manager.get(id)) {
            Ok(record) => record,
            Err(e) => return error_response(&e),
        };

        let info = BasePathInfo::new(&record, self.manager.base_path(&record.id));
        ok_json(StatusCode::OK, ApiResponse::ok(info))
            .unwrap_or_else(|e| json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    /// Collect a request body, refusing anything over the upload limit
    async fn read_body(&self, req: Request<Incoming>) -> std::result::Result<Bytes, Response<Full<Bytes>>> {
        match Limited::new(req.into_body(), self.max_upload_bytes).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Request body exceeds {} bytes", self.max_upload_bytes),
            )),
            Err(e) => Err(json_error(
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {}", e),
            )),
        }
    }
}

/// Split `/api/apps/{id}` or `/api/apps/{id}/{action}`
fn app_route(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix("/api/apps/")?;
    let mut parts = rest.splitn(2, '/');
    let id = parts.next().filter(|id| !id.is_empty())?;
    match parts.next() {
        None | Some("") => Some((id, None)),
        Some(action) if !action.contains('/') => Some((id, Some(action))),
        Some(_) => None,
    }
}

fn log_tail(query: Option<&str>) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "tail")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .map(|tail| tail.clamp(1, MAX_LOG_TAIL))
        .unwrap_or(DEFAULT_LOG_TAIL)
}

fn record_response(
    status: StatusCode,
    result: std::result::Result<AppRecord, AppError>,
) -> Result<Response<Full<Bytes>>> {
    match result {
        Ok(record) => ok_json(status, ApiResponse::ok(record)),
        Err(e) => app_error(e),
    }
}

fn app_error(e: AppError) -> Result<Response<Full<Bytes>>> {
    Ok(error_response(&e))
}

fn error_response(e: &AppError) -> Response<Full<Bytes>> {
    if e.status_code().is_server_error() {
        error!(error = %e, code = e.code(), "App operation failed");
    } else {
        debug!(error = %e, code = e.code(), "App operation rejected");
    }

    let mut body: ApiResponse<()> = ApiResponse::error(e.to_string());
    body.code = Some(e.code());
    ok_json(e.status_code(), body)
        .unwrap_or_else(|_| json_response(e.status_code(), r#"{"success":false}"#))
}

// ==================== Helper Functions ====================

fn ok_json<T: Serialize>(status: StatusCode, body: ApiResponse<T>) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(&body)?))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false}"#.to_string());
    json_response(status, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response() {
        let response: ApiResponse<String> = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, Some("test".to_string()));
        assert!(response.error.is_none());

        let error: ApiResponse<String> = ApiResponse::error("failed");
        assert!(!error.success);
        assert!(error.data.is_none());
        assert_eq!(error.error, Some("failed".to_string()));

        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"failed"}"#);
    }

    #[test]
    fn test_app_route() {
        assert_eq!(app_route("/api/apps/demo"), Some(("demo", None)));
        assert_eq!(app_route("/api/apps/demo/"), Some(("demo", None)));
        assert_eq!(app_route("/api/apps/demo/start"), Some(("demo", Some("start"))));
        assert_eq!(app_route("/api/apps/demo/logs/extra"), None);
        assert_eq!(app_route("/api/apps/"), None);
        assert_eq!(app_route("/api/other"), None);
    }

    #[test]
    fn test_log_tail() {
        assert_eq!(log_tail(None), DEFAULT_LOG_TAIL);
        assert_eq!(log_tail(Some("tail=20")), 20);
        assert_eq!(log_tail(Some("follow=1&tail=7")), 7);
        assert_eq!(log_tail(Some("tail=999999")), MAX_LOG_TAIL);
        assert_eq!(log_tail(Some("tail=0")), 1);
        assert_eq!(log_tail(Some("tail=abc")), DEFAULT_LOG_TAIL);
    }

    #[test]
    fn test_settings_update_password_handling() {
        let current = RuntimeSettings {
            use_sudo: false,
            sudo_password: Some("secret".to_string()),
        };

        let keep: UpdateSettingsRequest = serde_json::from_str(r#"{"useSudo":true}"#).unwrap();
        let updated = keep.apply(current.clone());
        assert!(updated.use_sudo);
        assert_eq!(updated.sudo_password.as_deref(), Some("secret"));

        let clear: UpdateSettingsRequest =
            serde_json::from_str(r#"{"useSudo":true,"sudoPassword":""}"#).unwrap();
        assert!(clear.apply(current.clone()).sudo_password.is_none());

        let replace: UpdateSettingsRequest =
            serde_json::from_str(r#"{"useSudo":false,"sudoPassword":"new"}"#).unwrap();
        assert_eq!(replace.apply(current).sudo_password.as_deref(), Some("new"));
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&AppError::Conflict("exists".to_string()));
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = error_response(&AppError::not_found("demo"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
