//! HTTP host for WebDriver clients.
//!
//! Every route lives under a configurable base path (`/wd/hub` by default).
//! Requests under `/session/{id}/` go to the session's driver: forwarded to
//! the device when the driver is proxying and the route is not excluded,
//! otherwise matched against the local command table.

use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use selendroid_core::error::ApiError;
use selendroid_core::protocol::{BuildInfo, HostStatus, HttpMethod, NewSessionRequest, WireResponse};
use selendroid_core::routes::match_route;

use crate::daemon::session::{DriverFactory, SessionRegistry};
use crate::driver::{CommandParams, ProxiedResponse};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 4884;
pub const DEFAULT_BASE_PATH: &str = "/wd/hub";

/// Where the host listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            base_path: DEFAULT_BASE_PATH.into(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
}

/// An error rendered as a JSON wire body with the matching HTTP status.
struct WireError {
    session_id: Option<String>,
    err: ApiError,
}

impl WireError {
    fn new(session_id: Option<&str>, err: ApiError) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            err,
        }
    }
}

impl IntoResponse for WireError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.err.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("{}", self.err);
        } else {
            debug!("{}", self.err);
        }
        let body = WireResponse::error(self.session_id.as_deref(), &self.err);
        (status, Json(body)).into_response()
    }
}

type WireResult = std::result::Result<Json<WireResponse>, WireError>;

/// Strip trailing slashes and make sure the path is absolute.
/// Returns an empty string for the root.
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Build the router with every endpoint mounted under `base_path`.
pub fn build_app(registry: Arc<SessionRegistry>, base_path: &str) -> Router {
    let routes = Router::new()
        .route("/status", get(status))
        .route("/session", post(create_session))
        .route("/sessions", get(list_sessions))
        .route(
            "/session/{session_id}",
            get(get_session).delete(delete_session),
        )
        .route("/session/{session_id}/{*path}", any(session_command))
        .with_state(AppState { registry });

    let base_path = normalize_base_path(base_path);
    let app = if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    };
    app.fallback(unknown_route)
}

/// The bound HTTP host.
pub struct HostServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    base_path: String,
}

impl HostServer {
    pub async fn bind(config: &HostConfig, factory: DriverFactory) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;

        let base_path = normalize_base_path(&config.base_path);
        info!(
            "Selendroid driver listening on http://{}{}",
            listener.local_addr()?,
            base_path
        );

        Ok(Self {
            listener,
            registry: Arc::new(SessionRegistry::new(factory)),
            base_path,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serve until `shutdown` resolves, then tear down every open session.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_app(self.registry.clone(), &self.base_path);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP host failed")?;

        self.registry.shutdown_all().await;
        info!("Host stopped");
        Ok(())
    }
}

async fn status() -> Json<WireResponse> {
    let status = HostStatus {
        ready: true,
        message: "Selendroid driver is ready to create sessions".into(),
        build: BuildInfo {
            version: env!("CARGO_PKG_VERSION").into(),
        },
    };
    Json(WireResponse::success(None, json!(status)))
}

async fn create_session(State(state): State<AppState>, body: Bytes) -> WireResult {
    let request: NewSessionRequest = parse_body(&body, None)?;
    let caps = request.merged_capabilities();
    debug!("Creating session with {} capabilities", caps.len());

    let (id, caps) = state
        .registry
        .create_session(caps)
        .await
        .map_err(|e| WireError::new(None, e))?;

    Ok(Json(WireResponse::success(Some(&id), Value::Object(caps))))
}

async fn list_sessions(State(state): State<AppState>) -> Json<WireResponse> {
    let sessions: Vec<Value> = state
        .registry
        .list_sessions()
        .await
        .into_iter()
        .map(|s| json!({ "id": s.id, "capabilities": s.capabilities, "createdAt": s.created_at }))
        .collect();
    Json(WireResponse::success(None, Value::Array(sessions)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> WireResult {
    let driver = state
        .registry
        .get(&session_id)
        .await
        .map_err(|e| WireError::new(Some(&session_id), e))?;

    let caps = driver
        .lock()
        .await
        .info()
        .map(|info| info.capabilities)
        .unwrap_or_else(|| Value::Object(Map::new()));
    Ok(Json(WireResponse::success(Some(&session_id), caps)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> WireResult {
    state
        .registry
        .delete_session(&session_id)
        .await
        .map_err(|e| WireError::new(Some(&session_id), e))?;
    Ok(Json(WireResponse::success(Some(&session_id), Value::Null)))
}

async fn session_command(
    State(state): State<AppState>,
    Path((session_id, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let sid = Some(session_id.as_str());
    let full_path = match uri.query() {
        Some(query) => format!("/session/{}/{}?{}", session_id, rest, query),
        None => format!("/session/{}/{}", session_id, rest),
    };

    let Ok(wire_method) = HttpMethod::from_str(method.as_str()) else {
        return WireError::new(sid, ApiError::unknown_command(method.as_str(), &full_path))
            .into_response();
    };

    let driver = match state.registry.get(&session_id).await {
        Ok(driver) => driver,
        Err(e) => return WireError::new(sid, e).into_response(),
    };
    let mut driver = driver.lock().await;

    let bare_path = full_path.split('?').next().unwrap_or(&full_path);
    let excluded = driver
        .proxy_avoid_list()
        .iter()
        .any(|e| e.matches(wire_method, bare_path));

    if driver.proxy_active() && !excluded {
        debug!("Proxying {} {}", wire_method, full_path);
        return match driver
            .proxy_req_res(wire_method, &full_path, body.to_vec())
            .await
        {
            Ok(res) => passthrough(res),
            Err(e) => WireError::new(sid, e).into_response(),
        };
    }

    let Some(route) = match_route(wire_method, &rest) else {
        return WireError::new(sid, ApiError::unknown_command(wire_method.as_str(), &full_path))
            .into_response();
    };

    let params: Value = match parse_body(&body, sid) {
        Ok(params) => params,
        Err(e) => return e.into_response(),
    };

    debug!("Executing {} for session {}", route.command, session_id);
    match driver
        .execute(route.command, CommandParams::new(route.params, params))
        .await
    {
        Ok(value) => Json(WireResponse::success(sid, value)).into_response(),
        Err(e) => WireError::new(sid, e).into_response(),
    }
}

async fn unknown_route(method: Method, uri: Uri) -> WireError {
    WireError::new(None, ApiError::unknown_command(method.as_str(), uri.path()))
}

/// Relay a device response untouched.
fn passthrough(res: ProxiedResponse) -> Response {
    let status = StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        res.body,
    )
        .into_response()
}

/// Decode a JSON body. An empty body decodes as `{}`.
fn parse_body<T>(body: &[u8], session_id: Option<&str>) -> std::result::Result<T, WireError>
where
    T: serde::de::DeserializeOwned,
{
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| {
        WireError::new(
            session_id,
            ApiError::validation(format!("Request body is not valid JSON: {}", e)),
        )
    })
}
