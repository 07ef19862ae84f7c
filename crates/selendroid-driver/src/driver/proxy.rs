//! JSON wire proxy to the on-device Selendroid server.
//!
//! The driver talks to the server two ways. [`JsonWireProxy::command`] is
//! used for calls the driver makes itself and unwraps the JSON wire
//! envelope. [`JsonWireProxy::proxy_req_res`] forwards a client request and
//! hands back the server's status and body untouched.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use selendroid_core::error::ApiError;
use selendroid_core::protocol::{HttpMethod, WireResponse};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-request timeout for calls to the device.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

static SESSION_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/session/[^/]+").expect("SESSION_SEGMENT should compile")
});

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Selendroid returned status {status}: {message}")]
    Remote { status: i64, message: String },

    #[error("invalid response from {url}: {body}")]
    InvalidResponse { url: String, body: String },

    #[error("no Selendroid session has been started")]
    NoSession,
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Transport { .. } | ProxyError::InvalidResponse { .. } => {
                ApiError::proxy_transport(err.to_string())
            }
            other => ApiError::command_failed(other.to_string()),
        }
    }
}

/// A forwarded response, exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedResponse {
    pub status: u16,
    pub body: String,
}

/// Client for one Selendroid server instance.
#[derive(Debug)]
pub struct JsonWireProxy {
    http: Client,
    base_url: String,
    session_id: RwLock<Option<String>>,
}

impl JsonWireProxy {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            http: Client::new(),
            base_url: format!("http://{}:{}/wd/hub", host, port),
            session_id: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Remote session id captured from `POST /session`.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn remote_session(&self) -> Result<String, ProxyError> {
        self.session_id().await.ok_or(ProxyError::NoSession)
    }

    /// Map a driver-relative path onto the server.
    ///
    /// `/status` and `POST /session` are global, `/` is the session itself
    /// and everything else hangs off the session.
    async fn command_url(&self, path: &str, method: HttpMethod) -> Result<String, ProxyError> {
        let is_global =
            path == "/status" || (path == "/session" && method == HttpMethod::Post);
        if is_global {
            return Ok(format!("{}{}", self.base_url, path));
        }

        let session_id = self.remote_session().await?;
        let suffix = if path == "/" { "" } else { path };
        Ok(format!("{}/session/{}{}", self.base_url, session_id, suffix))
    }

    /// Issue a command and return the `value` of a successful response.
    pub async fn command(
        &self,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Value, ProxyError> {
        let url = self.command_url(path, method).await?;
        let body = match method {
            HttpMethod::Post => {
                let payload = body.unwrap_or_else(|| json!({}));
                Some(payload.to_string().into_bytes())
            }
            _ => None,
        };

        let response = self.send(method, &url, body).await?;
        let wire: WireResponse = serde_json::from_str(&response.body).map_err(|_| {
            ProxyError::InvalidResponse {
                url: url.clone(),
                body: response.body.clone(),
            }
        })?;

        if response.status >= 400 || !wire.is_success() {
            return Err(ProxyError::Remote {
                status: wire.status,
                message: wire.error_message(),
            });
        }

        if method == HttpMethod::Post && path == "/session" {
            let session_id = wire
                .session_id
                .clone()
                .or_else(|| {
                    wire.value
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .ok_or_else(|| ProxyError::InvalidResponse {
                    url: url.clone(),
                    body: response.body.clone(),
                })?;
            debug!("Selendroid session id: {}", session_id);
            *self.session_id.write().await = Some(session_id);
        }

        Ok(wire.value)
    }

    /// Forward a client request, swapping the host session id for the
    /// remote one. The body goes out and comes back unmodified.
    pub async fn proxy_req_res(
        &self,
        method: HttpMethod,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, ProxyError> {
        let path = if SESSION_SEGMENT.is_match(path) {
            let session_id = self.remote_session().await?;
            SESSION_SEGMENT
                .replace(path, format!("/session/{}", session_id).as_str())
                .into_owned()
        } else {
            path.to_string()
        };
        let url = format!("{}{}", self.base_url, path);
        let body = (method == HttpMethod::Post).then_some(body);
        self.send(method, &url, body).await
    }

    /// Forget the remote session.
    pub async fn clear_session(&self) {
        *self.session_id.write().await = None;
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ProxiedResponse, ProxyError> {
        debug!("Proxying [{} {}]", method, url);
        let mut request = match method {
            HttpMethod::Get => self.http.get(url),
            HttpMethod::Post => self.http.post(url),
            HttpMethod::Delete => self.http.delete(url),
        }
        .timeout(REQUEST_TIMEOUT);

        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
                .body(body);
        }

        let transport = |source| ProxyError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        debug!("Got response with status {}: {}", status, body);
        Ok(ProxiedResponse { status, body })
    }
}
