//! Wire types shared by the host, the driver and the Selendroid server.
//!
//! Selendroid speaks the legacy JSON wire protocol: every body carries a
//! numeric `status` (0 on success), a `value` and usually a `sessionId`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ApiError;

/// HTTP methods used by WebDriver endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(ApiError::unknown_command(other, "")),
        }
    }
}

/// A JSON wire protocol response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl WireResponse {
    pub fn success(session_id: Option<&str>, value: Value) -> Self {
        Self {
            status: 0,
            value,
            session_id: session_id.map(str::to_string),
        }
    }

    /// Build an error body carrying both the JSON wire status and the W3C
    /// error shape so either kind of client can read it.
    pub fn error(session_id: Option<&str>, err: &ApiError) -> Self {
        Self {
            status: err.code.jsonwp_status(),
            value: json!({
                "error": err.code.w3c_error(),
                "message": err.to_string(),
                "stacktrace": "",
            }),
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Human readable message from a failed response.
    pub fn error_message(&self) -> String {
        self.value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.value.to_string())
    }
}

/// Body of `POST /session`.
///
/// Accepts both the JSON wire `desiredCapabilities` object and the W3C
/// `capabilities.alwaysMatch`/`firstMatch` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSessionRequest {
    #[serde(rename = "desiredCapabilities", default, skip_serializing_if = "Option::is_none")]
    pub desired_capabilities: Option<Map<String, Value>>,
    #[serde(rename = "requiredCapabilities", default, skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<W3cCapabilities>,
}

/// W3C capability negotiation block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct W3cCapabilities {
    #[serde(rename = "alwaysMatch", default)]
    pub always_match: Map<String, Value>,
    #[serde(rename = "firstMatch", default)]
    pub first_match: Vec<Map<String, Value>>,
}

impl NewSessionRequest {
    /// Flatten the request into one capability map.
    ///
    /// Desired capabilities are the base, required capabilities override
    /// them, then W3C `alwaysMatch` and the first `firstMatch` entry. Vendor
    /// prefixes (`appium:`) are stripped.
    pub fn merged_capabilities(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        let mut merge = |source: &Map<String, Value>| {
            for (key, value) in source {
                let key = key.strip_prefix("appium:").unwrap_or(key);
                merged.insert(key.to_string(), value.clone());
            }
        };

        if let Some(desired) = &self.desired_capabilities {
            merge(desired);
        }
        if let Some(required) = &self.required_capabilities {
            merge(required);
        }
        if let Some(w3c) = &self.capabilities {
            merge(&w3c.always_match);
            if let Some(first) = w3c.first_match.first() {
                merge(first);
            }
        }
        merged
    }
}

/// Body of `GET /status` on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub ready: bool,
    pub message: String,
    pub build: BuildInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
}

/// Information about an active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub capabilities: Value,
    pub created_at: String,
}
