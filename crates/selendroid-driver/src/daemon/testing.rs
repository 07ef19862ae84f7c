//! A scripted [`SessionLifecycle`] for host tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use selendroid_core::error::ApiError;
use selendroid_core::protocol::{HttpMethod, SessionInfo};
use selendroid_core::routes::{self, ProxyExclusion};
use serde_json::{json, Map, Value};

use crate::daemon::session::DriverFactory;
use crate::driver::{CommandParams, ProxiedResponse, SessionLifecycle};

/// What every stub created by one factory reports back.
#[derive(Default)]
pub(crate) struct StubLog {
    pub created: AtomicUsize,
    pub deleted: AtomicUsize,
    pub executed: Mutex<Vec<(String, CommandParams)>>,
    pub proxied: Mutex<Vec<(HttpMethod, String, Vec<u8>)>>,
}

impl StubLog {
    pub fn executed(&self) -> Vec<(String, CommandParams)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn proxied(&self) -> Vec<(HttpMethod, String, Vec<u8>)> {
        self.proxied.lock().unwrap().clone()
    }
}

pub(crate) struct StubDriver {
    log: Arc<StubLog>,
    fail_create: bool,
    proxying: bool,
    session: Option<SessionInfo>,
}

#[async_trait]
impl SessionLifecycle for StubDriver {
    async fn create_session(
        &mut self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError> {
        if self.fail_create {
            return Err(ApiError::app_not_found("/nowhere/app.apk"));
        }
        let n = self.log.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("stub-{}", n + 1);
        self.session = Some(SessionInfo {
            id: id.clone(),
            capabilities: Value::Object(caps.clone()),
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        Ok((id, caps))
    }

    async fn delete_session(&mut self) {
        self.session = None;
        self.log.deleted.fetch_add(1, Ordering::SeqCst);
    }

    fn info(&self) -> Option<SessionInfo> {
        self.session.clone()
    }

    fn proxy_active(&self) -> bool {
        self.proxying && self.session.is_some()
    }

    fn can_proxy(&self) -> bool {
        self.session.is_some()
    }

    fn proxy_avoid_list(&self) -> &'static [ProxyExclusion] {
        routes::proxy_avoid_list()
    }

    async fn execute(&mut self, command: &str, params: CommandParams) -> Result<Value, ApiError> {
        self.log
            .executed
            .lock()
            .unwrap()
            .push((command.to_string(), params.clone()));
        match command {
            "getContexts" => Ok(json!(["NATIVE_APP"])),
            "setContext" => Err(ApiError::no_such_context("WEBVIEW_9")),
            _ => Ok(Value::Null),
        }
    }

    async fn proxy_req_res(
        &self,
        method: HttpMethod,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, ApiError> {
        self.log
            .proxied
            .lock()
            .unwrap()
            .push((method, path.to_string(), body));
        if path.ends_with("/unreachable") {
            return Err(ApiError::proxy_transport("connection refused"));
        }
        Ok(ProxiedResponse {
            status: 200,
            body: r#"{"status":0,"value":"from-device","sessionId":"remote-1"}"#.to_string(),
        })
    }
}

/// Factory for stubs that forward once a session exists.
pub(crate) fn stub_factory(log: Arc<StubLog>) -> DriverFactory {
    Arc::new(move || {
        Box::new(StubDriver {
            log: log.clone(),
            fail_create: false,
            proxying: true,
            session: None,
        }) as Box<dyn SessionLifecycle>
    })
}

/// Factory for stubs that never forward.
pub(crate) fn local_only_factory(log: Arc<StubLog>) -> DriverFactory {
    Arc::new(move || {
        Box::new(StubDriver {
            log: log.clone(),
            fail_create: false,
            proxying: false,
            session: None,
        }) as Box<dyn SessionLifecycle>
    })
}

/// Factory for stubs whose startup always fails.
pub(crate) fn failing_factory(log: Arc<StubLog>) -> DriverFactory {
    Arc::new(move || {
        Box::new(StubDriver {
            log: log.clone(),
            fail_create: true,
            proxying: false,
            session: None,
        }) as Box<dyn SessionLifecycle>
    })
}
