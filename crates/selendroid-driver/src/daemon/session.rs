//! Registry of live driver sessions.
//!
//! Each client session owns one driver instance. The driver sits behind a
//! `tokio::sync::Mutex` so commands within a session run one at a time while
//! different sessions proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use selendroid_core::error::ApiError;
use selendroid_core::protocol::SessionInfo;

use crate::driver::SessionLifecycle;

/// Maximum number of concurrent sessions to prevent resource exhaustion.
pub const MAX_SESSIONS: usize = 100;

/// A driver shared between the registry and in-flight requests.
pub type SharedDriver = Arc<Mutex<Box<dyn SessionLifecycle>>>;

/// Builds a fresh, idle driver for each new session.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn SessionLifecycle> + Send + Sync>;

/// Tracks every session the host has started.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedDriver>>,
    factory: DriverFactory,
}

impl SessionRegistry {
    pub fn new(factory: DriverFactory) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Start a new session with a fresh driver.
    ///
    /// The limit is checked before startup so a full host fails fast, and
    /// again on insert since startup can take minutes. A driver that loses
    /// that race is torn down before the error is returned.
    pub async fn create_session(
        &self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError> {
        if self.sessions.read().await.len() >= MAX_SESSIONS {
            return Err(ApiError::session_limit_reached(MAX_SESSIONS));
        }

        let mut driver = (self.factory)();
        let (id, caps) = driver.create_session(caps).await?;

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            drop(sessions);
            driver.delete_session().await;
            return Err(ApiError::session_limit_reached(MAX_SESSIONS));
        }
        sessions.insert(id.clone(), Arc::new(Mutex::new(driver)));
        info!("Registered session {} ({} active)", id, sessions.len());

        Ok((id, caps))
    }

    /// Get the driver behind a session id.
    pub async fn get(&self, id: &str) -> Result<SharedDriver, ApiError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::session_not_found(id))
    }

    /// Remove a session and tear its driver down.
    ///
    /// The entry is removed first so no new request can reach a driver
    /// that is shutting down.
    pub async fn delete_session(&self, id: &str) -> Result<(), ApiError> {
        let driver = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ApiError::session_not_found(id))?;

        driver.lock().await.delete_session().await;
        info!("Deleted session {}", id);
        Ok(())
    }

    /// List all active sessions.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let drivers: Vec<SharedDriver> = self.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(drivers.len());
        for driver in drivers {
            if let Some(info) = driver.lock().await.info() {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Tear down every session. Used when the host shuts down.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, SharedDriver)> = self.sessions.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        warn!("Shutting down {} active session(s)", drained.len());
        for (id, driver) in drained {
            driver.lock().await.delete_session().await;
            info!("Deleted session {} on shutdown", id);
        }
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
