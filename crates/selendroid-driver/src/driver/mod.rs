//! The Selendroid driver.
//!
//! The host only sees [`SessionLifecycle`]; [`SelendroidDriver`] implements
//! it on top of the device layer in [`adb`], the server manager in
//! [`server`] and the proxy in [`proxy`].

pub mod adb;
pub mod commands;
pub mod helpers;
pub mod proxy;
pub mod retry;
pub mod server;
pub mod session;
pub mod setup;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use selendroid_core::error::ApiError;
use selendroid_core::protocol::{HttpMethod, SessionInfo};
use selendroid_core::routes::ProxyExclusion;
use serde_json::{Map, Value};

pub use commands::CommandParams;
pub use proxy::ProxiedResponse;
pub use session::{DriverOptions, SelendroidDriver};

/// What the HTTP host needs from a driver.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    /// Start a session. Returns its id and the capabilities in effect.
    async fn create_session(
        &mut self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError>;

    /// Tear down whatever the session started. Never fails.
    async fn delete_session(&mut self);

    fn info(&self) -> Option<SessionInfo>;

    /// True once requests may be forwarded to the device.
    fn proxy_active(&self) -> bool;

    fn can_proxy(&self) -> bool;

    fn proxy_avoid_list(&self) -> &'static [ProxyExclusion];

    /// Run a locally handled command by name.
    async fn execute(&mut self, command: &str, params: CommandParams) -> Result<Value, ApiError>;

    /// Forward a request to the device unchanged.
    async fn proxy_req_res(
        &self,
        method: HttpMethod,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, ApiError>;
}
