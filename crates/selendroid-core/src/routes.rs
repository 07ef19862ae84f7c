//! Session command routing.
//!
//! Two tables drive dispatch inside a session:
//!
//! - [`proxy_avoid_list`]: requests that must never be forwarded to the
//!   Selendroid server, either because it lacks the endpoint or because the
//!   driver applies Android-specific handling first.
//! - [`ROUTES`]: the locally handled commands, keyed by method and a path
//!   pattern relative to `/session/{sessionId}/`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::protocol::HttpMethod;

/// A (method, path pattern) pair the proxy must not forward.
#[derive(Debug)]
pub struct ProxyExclusion {
    pub method: HttpMethod,
    pub pattern: Regex,
}

impl ProxyExclusion {
    pub fn matches(&self, method: HttpMethod, path: &str) -> bool {
        self.method == method && self.pattern.is_match(path)
    }
}

const AVOID: &[(HttpMethod, &str)] = &[
    (HttpMethod::Get, r"^/session/[^/]+/log/types$"),
    (HttpMethod::Post, r"^/session/[^/]+/log$"),
    (HttpMethod::Post, r"^/session/[^/]+/location$"),
    (
        HttpMethod::Post,
        r"^/session/[^/]+/appium/(device/(keyevent|press_keycode)|app/(launch|reset|strings|close))$",
    ),
    (HttpMethod::Post, r"^/session/[^/]+/context"),
    (HttpMethod::Get, r"^/session/[^/]+/context"),
    (HttpMethod::Post, r"^/session/[^/]+/element/[^/]+/value$"),
    (HttpMethod::Get, r"^/session/[^/]+/element/[^/]+/rect$"),
    (HttpMethod::Get, r"^/session/[^/]+/network_connection$"),
    (HttpMethod::Post, r"^/session/[^/]+/network_connection$"),
    (HttpMethod::Get, r"^/session/[^/]+/ime"),
    (HttpMethod::Post, r"^/session/[^/]+/ime"),
    (HttpMethod::Post, r"^/session/[^/]+/keys$"),
    (HttpMethod::Post, r"^/session/[^/]+/touch/multi/perform$"),
    (HttpMethod::Post, r"^/session/[^/]+/back$"),
];

static AVOID_LIST: LazyLock<Vec<ProxyExclusion>> = LazyLock::new(|| {
    AVOID
        .iter()
        .map(|(method, pattern)| ProxyExclusion {
            method: *method,
            pattern: Regex::new(pattern).expect("proxy exclusion pattern should compile"),
        })
        .collect()
});

/// The fixed exclusion list, compiled on first use.
pub fn proxy_avoid_list() -> &'static [ProxyExclusion] {
    &AVOID_LIST
}

/// Whether a full `/session/...` request path must be handled locally.
pub fn is_excluded(method: HttpMethod, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    proxy_avoid_list().iter().any(|e| e.matches(method, path))
}

/// A locally handled command.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub method: HttpMethod,
    /// Path relative to `/session/{sessionId}/`. `:name` segments capture.
    pub pattern: &'static str,
    pub command: &'static str,
}

const fn route(method: HttpMethod, pattern: &'static str, command: &'static str) -> Route {
    Route {
        method,
        pattern,
        command,
    }
}

/// Commands the driver implements itself.
pub const ROUTES: &[Route] = &[
    route(HttpMethod::Post, "element/:elementId/value", "setValue"),
    route(HttpMethod::Post, "keys", "keys"),
    route(HttpMethod::Get, "element/:elementId/rect", "getElementRect"),
    route(HttpMethod::Post, "touch/multi/perform", "performMultiAction"),
    route(HttpMethod::Post, "appium/device/keyevent", "keyevent"),
    route(HttpMethod::Post, "appium/device/press_keycode", "pressKeyCode"),
    route(HttpMethod::Post, "back", "back"),
    route(HttpMethod::Get, "contexts", "getContexts"),
    route(HttpMethod::Get, "context", "getCurrentContext"),
    route(HttpMethod::Post, "context", "setContext"),
    route(HttpMethod::Get, "log/types", "getLogTypes"),
    route(HttpMethod::Post, "log", "getLog"),
    route(HttpMethod::Post, "location", "setGeoLocation"),
    route(HttpMethod::Get, "network_connection", "getNetworkConnection"),
    route(HttpMethod::Post, "network_connection", "setNetworkConnection"),
    route(HttpMethod::Get, "ime/available_engines", "availableIMEEngines"),
    route(HttpMethod::Get, "ime/active_engine", "getActiveIMEEngine"),
    route(HttpMethod::Get, "ime/activated", "isIMEActivated"),
    route(HttpMethod::Post, "ime/activate", "activateIMEEngine"),
    route(HttpMethod::Post, "ime/deactivate", "deactivateIMEEngine"),
    route(HttpMethod::Post, "appium/app/launch", "launchApp"),
    route(HttpMethod::Post, "appium/app/reset", "reset"),
    route(HttpMethod::Post, "appium/app/strings", "getStrings"),
    route(HttpMethod::Post, "appium/app/close", "closeApp"),
];

/// Result of matching a request against [`ROUTES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub command: &'static str,
    pub params: HashMap<String, String>,
}

/// Find the local command for a path relative to the session.
///
/// Leading and trailing slashes are ignored, as is any query string.
pub fn match_route(method: HttpMethod, path: &str) -> Option<RouteMatch> {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    ROUTES
        .iter()
        .filter(|r| r.method == method)
        .find_map(|r| match_pattern(r.pattern, &segments).map(|params| RouteMatch {
            command: r.command,
            params,
        }))
}

fn match_pattern(pattern: &str, segments: &[&str]) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = pattern.split('/').collect();
    if parts.len() != segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (part, segment) in parts.iter().zip(segments) {
        if let Some(name) = part.strip_prefix(':') {
            if segment.is_empty() {
                return None;
            }
            params.insert(name.to_string(), (*segment).to_string());
        } else if part != segment {
            return None;
        }
    }
    Some(params)
}
