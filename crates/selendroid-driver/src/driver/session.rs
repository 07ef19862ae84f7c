//! Session orchestration for one Selendroid session.
//!
//! [`SelendroidDriver`] runs the startup sequence (device, server build,
//! port forward, install, instrumentation) and tears all of it down again,
//! from whatever point startup reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selendroid_core::caps::{self, Capabilities};
use selendroid_core::error::ApiError;
use selendroid_core::protocol::{HttpMethod, SessionInfo};
use selendroid_core::routes::{self, ProxyExclusion};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::adb::{DeviceBridge, DeviceControl, StartAppOptions};
use super::commands::{self, CommandParams, CommandTable, DEFAULT_WEBVIEW_CONTEXT, NATIVE_CONTEXT};
use super::helpers::{self, ResolvedLaunch};
use super::proxy::{JsonWireProxy, ProxiedResponse};
use super::retry::{retry_interval, RetryPolicy};
use super::server::{SelendroidServer, ServerOptions, DEVICE_PORT, STATUS_POLICY};
use super::setup::{server_exists, ServerArtifacts};
use super::sync::{BuildLocks, PortPool};
use super::SessionLifecycle;

/// Ports tried for the forwarded server when none is requested.
pub const SYSTEM_PORT_RANGE: std::ops::RangeInclusive<u16> = 8200..=8299;

/// How far startup has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    ValidatingCaps,
    DeviceSelected,
    ServerPrepared,
    PortForwarded,
    AppInstalled,
    ServerRunning,
    SessionActive,
    Deleted,
}

/// Timeouts and retry budgets for startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub status: RetryPolicy,
    /// How long the AUT gets to reach its wait activity.
    pub launch_wait: Duration,
    pub webview_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            status: STATUS_POLICY,
            launch_wait: Duration::from_secs(5),
            webview_interval: Duration::from_millis(500),
        }
    }
}

/// Process-wide settings every driver shares.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub tmp_dir: PathBuf,
    pub artifacts: ServerArtifacts,
    pub build_locks: BuildLocks,
    pub ports: PortPool,
    /// Host the forwarded server port is reached on.
    pub host: String,
    pub timing: Timing,
}

impl DriverOptions {
    pub fn new(tmp_dir: impl Into<PathBuf>, server_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            artifacts: ServerArtifacts::in_dir(server_dir),
            build_locks: BuildLocks::new(),
            ports: PortPool::new(),
            host: "127.0.0.1".into(),
            timing: Timing::default(),
        }
    }
}

/// State of the active session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub caps: Map<String, Value>,
    pub current_context: String,
    pub proxy_active: bool,
    pub system_port: u16,
    /// IME to restore on teardown when the unicode keyboard replaced it.
    pub default_ime: Option<String>,
    pub apk_strings: Map<String, Value>,
    pub java_version: Option<String>,
    /// AVD this session booted or was asked to reboot.
    pub booted_emulator: Option<String>,
    pub launch: Option<ResolvedLaunch>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(caps: Map<String, Value>, system_port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caps,
            current_context: NATIVE_CONTEXT.to_string(),
            proxy_active: false,
            system_port,
            default_ime: None,
            apk_strings: Map::new(),
            java_version: None,
            booted_emulator: None,
            launch: None,
            created_at: Utc::now(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            capabilities: Value::Object(self.caps.clone()),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Context switch attempts for an `autoWebviewTimeout` in milliseconds, one
/// every 500ms. Defaults to 20.
fn webview_attempts(timeout_ms: Option<u64>) -> u32 {
    timeout_ms
        .map(|ms| u32::try_from(ms / 500).unwrap_or(u32::MAX).max(1))
        .unwrap_or(20)
}

fn no_session() -> ApiError {
    ApiError::command_failed_with_suggestion(
        "No Selendroid session is running",
        "Create a session before sending commands",
    )
}

fn teardown_step<E: std::fmt::Display>(step: &str, result: Result<(), E>) {
    if let Err(e) = result {
        warn!("Teardown step '{}' failed: {}", step, e);
    }
}

/// Drives one Selendroid session.
pub struct SelendroidDriver {
    opts: DriverOptions,
    bridge: Arc<dyn DeviceBridge>,
    caps: Capabilities,
    session: Option<Session>,
    device: Option<Arc<dyn DeviceControl>>,
    server: Option<SelendroidServer>,
    state: SessionState,
    commands: CommandTable,
    /// System port this driver holds in the shared pool.
    claimed_port: Option<u16>,
}

impl SelendroidDriver {
    pub fn new(opts: DriverOptions, bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            opts,
            bridge,
            caps: Capabilities::default(),
            session: None,
            device: None,
            server: None,
            state: SessionState::Idle,
            commands: CommandTable::new(),
            claimed_port: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn session(&self) -> Result<&Session, ApiError> {
        self.session.as_ref().ok_or_else(no_session)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session, ApiError> {
        self.session.as_mut().ok_or_else(no_session)
    }

    pub fn device(&self) -> Result<Arc<dyn DeviceControl>, ApiError> {
        self.device.clone().ok_or_else(no_session)
    }

    pub fn proxy(&self) -> Result<Arc<JsonWireProxy>, ApiError> {
        self.server
            .as_ref()
            .map(|server| server.proxy().clone())
            .ok_or_else(no_session)
    }

    fn app_path(&self) -> Result<PathBuf, ApiError> {
        self.caps
            .app
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| ApiError::missing_capability("app"))
    }

    fn launch(&self) -> Result<&ResolvedLaunch, ApiError> {
        self.session()?.launch.as_ref().ok_or_else(no_session)
    }

    /// Validate capabilities, start everything and return the new session.
    ///
    /// Any startup failure runs [`Self::delete_session`] before returning
    /// the error.
    pub async fn create_session(
        &mut self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError> {
        let installed = server_exists(&self.opts.artifacts).await.map_err(|e| {
            ApiError::environment(format!(
                "Could not check for the Selendroid server in {}: {}",
                self.opts.artifacts.dir.display(),
                e
            ))
        })?;
        if !installed {
            return Err(ApiError::setup_missing(
                &self.opts.artifacts.dir.display().to_string(),
            ));
        }

        match self.start(caps).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!("Session startup failed, cleaning up: {}", e);
                self.delete_session().await;
                Err(e)
            }
        }
    }

    async fn start(
        &mut self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError> {
        self.state = SessionState::ValidatingCaps;
        caps::validate(&caps)?;
        self.caps = Capabilities::from_map(&caps)?;

        let system_port = self.claim_system_port().await?;
        debug!("Using system port {}", system_port);
        self.session = Some(Session::new(caps, system_port));

        self.check_app_present().await?;
        self.start_selendroid_session().await?;

        let session = self.session()?;
        info!("Selendroid session {} started", session.id);
        Ok((session.id.clone(), session.caps.clone()))
    }

    /// Claim the requested system port, or the first free one in
    /// [`SYSTEM_PORT_RANGE`]. The claim lasts until [`Self::delete_session`].
    async fn claim_system_port(&mut self) -> Result<u16, ApiError> {
        let port = match self.caps.requested_system_port() {
            Some(port) => {
                if !self.opts.ports.claim(port) {
                    return Err(ApiError::environment(format!(
                        "System port {} is already used by another session",
                        port
                    )));
                }
                port
            }
            None => self
                .opts
                .ports
                .reserve(SYSTEM_PORT_RANGE)
                .await
                .ok_or_else(|| {
                    ApiError::environment(format!(
                        "No free system port in {}-{}",
                        SYSTEM_PORT_RANGE.start(),
                        SYSTEM_PORT_RANGE.end()
                    ))
                })?,
        };
        self.claimed_port = Some(port);
        Ok(port)
    }

    /// Fail early when the app file is missing rather than letting the
    /// install fail on the device.
    pub async fn check_app_present(&self) -> Result<(), ApiError> {
        let app = self.app_path()?;
        debug!("Checking whether app is actually present");
        let present = tokio::fs::try_exists(&app).await.unwrap_or(false);
        if !present {
            return Err(ApiError::app_not_found(&app.display().to_string()));
        }
        Ok(())
    }

    /// Provision the device and bring the Selendroid server up.
    pub async fn start_selendroid_session(&mut self) -> Result<(), ApiError> {
        let app = self.app_path()?;
        let system_port = self.session()?.system_port;

        if self.session()?.java_version.is_none() {
            let version = helpers::java_version(self.bridge.as_ref()).await?;
            self.session_mut()?.java_version = Some(version);
        }

        if self.caps.avd.is_some() || self.caps.reboot.unwrap_or(false) {
            let avd_name = self.caps.resolve_avd_name()?;
            if helpers::prepare_emulator(self.bridge.as_ref(), &self.caps, &avd_name).await? {
                info!("Launched AVD '{}'", avd_name);
            }
            self.session_mut()?.booted_emulator = Some(avd_name);
        }

        let handle = helpers::get_active_device(
            self.bridge.as_ref(),
            self.caps.udid.as_deref(),
            self.caps.adb_port,
        )
        .await?;
        let device = self.bridge.bind(handle);
        device.wait_for_device().await?;
        self.device = Some(device.clone());
        self.state = SessionState::DeviceSelected;

        helpers::ensure_internet_permission(device.as_ref(), &app).await?;

        let launch = helpers::resolve_launch_info(device.as_ref(), &app, &self.caps).await?;
        {
            let session = self.session_mut()?;
            session
                .caps
                .insert("appPackage".into(), json!(launch.package));
            session
                .caps
                .insert("appActivity".into(), json!(launch.activity));
            session
                .caps
                .insert("appWaitPackage".into(), json!(launch.wait_package));
            session
                .caps
                .insert("appWaitActivity".into(), json!(launch.wait_activity));
            session.launch = Some(launch.clone());
        }

        let server = SelendroidServer::new(
            ServerOptions {
                adb: Some(device.clone()),
                app_package: Some(launch.package.clone()),
                app_activity: Some(launch.activity.clone()),
                tmp_dir: Some(self.opts.tmp_dir.clone()),
                apk: Some(app.clone()),
                host: Some(self.opts.host.clone()),
                system_port: Some(system_port),
                device_port: Some(DEVICE_PORT),
            },
            self.opts.artifacts.clone(),
            self.opts.build_locks.clone(),
        )?
        .with_status_policy(self.opts.timing.status);
        let sign_app = !self.caps.no_sign.unwrap_or(false);
        server.prepare_modified_server(sign_app).await?;
        let server = self.server.insert(server);
        self.state = SessionState::ServerPrepared;

        device.forward_port(system_port, server.device_port()).await?;
        self.state = SessionState::PortForwarded;

        self.prepare_device(device.as_ref()).await?;

        helpers::install_app(device.as_ref(), &app, &launch.package, &self.caps).await?;
        let strings =
            helpers::extract_strings(device.as_ref(), &app, self.caps.language.as_deref()).await;
        self.session_mut()?.apk_strings = strings;
        self.state = SessionState::AppInstalled;

        let server = self.server.as_ref().ok_or_else(no_session)?;
        server.install_modified_server().await?;
        let caps = self.session()?.caps.clone();
        server.start_session(&caps).await?;
        self.state = SessionState::ServerRunning;

        self.ensure_app_started(device.as_ref(), &launch).await?;

        if self.caps.auto_webview.unwrap_or(false) {
            self.switch_to_webview().await?;
        }

        self.session_mut()?.proxy_active = true;
        self.state = SessionState::SessionActive;
        Ok(())
    }

    async fn prepare_device(&mut self, device: &dyn DeviceControl) -> Result<(), ApiError> {
        let rebooted = helpers::ensure_device_locale(
            device,
            self.caps.language.as_deref(),
            self.caps.locale.as_deref(),
        )
        .await?;
        if rebooted {
            device.wait_for_device().await?;
        }

        device.start_logcat().await?;

        if self.caps.unicode_keyboard() {
            let default_ime = helpers::init_unicode_keyboard(device).await?;
            self.session_mut()?.default_ime = default_ime;
        }

        device.unlock().await?;
        Ok(())
    }

    /// Wait for the AUT's activity, starting it ourselves if it never shows.
    async fn ensure_app_started(
        &self,
        device: &dyn DeviceControl,
        launch: &ResolvedLaunch,
    ) -> Result<(), ApiError> {
        debug!("Waiting for app to launch");
        let waited = device
            .wait_for_activity(
                &launch.wait_package,
                &launch.wait_activity,
                self.opts.timing.launch_wait,
            )
            .await;
        if let Err(e) = waited {
            info!(
                "Selendroid did not start the activity we were waiting for ({}), starting it ourselves",
                e
            );
            device.start_app(&self.start_app_options(false)?).await?;
        }
        Ok(())
    }

    async fn switch_to_webview(&mut self) -> Result<(), ApiError> {
        let attempts = webview_attempts(self.caps.auto_webview_timeout);
        let proxy = self.proxy()?;
        info!("Setting auto webview to {}", DEFAULT_WEBVIEW_CONTEXT);
        retry_interval(attempts, self.opts.timing.webview_interval, || {
            commands::switch_context(&proxy, DEFAULT_WEBVIEW_CONTEXT)
        })
        .await
        .map_err(|e| {
            ApiError::command_failed(format!(
                "Could not switch to the {} context: {}",
                DEFAULT_WEBVIEW_CONTEXT,
                e.into_last()
            ))
        })?;
        self.session_mut()?.current_context = DEFAULT_WEBVIEW_CONTEXT.to_string();
        Ok(())
    }

    /// `am start` arguments for the AUT.
    pub fn start_app_options(&self, stop_app: bool) -> Result<StartAppOptions, ApiError> {
        let launch = self.launch()?;
        Ok(StartAppOptions {
            package: launch.package.clone(),
            activity: launch.activity.clone(),
            wait_package: Some(launch.wait_package.clone()),
            wait_activity: Some(launch.wait_activity.clone()),
            action: self.caps.intent_action.clone(),
            category: self.caps.intent_category.clone(),
            flags: self.caps.intent_flags.clone(),
            optional_intent_arguments: self.caps.optional_intent_arguments.clone(),
            stop_app: stop_app && !self.caps.dont_stop_app_on_reset.unwrap_or(false),
        })
    }

    /// Tear the session down. Safe to call at any point and more than once.
    pub async fn delete_session(&mut self) {
        debug!("Deleting Selendroid session");
        if let Some(session) = self.session.as_mut() {
            session.proxy_active = false;
        }

        if let Some(server) = self.server.take() {
            if server.proxy().session_id().await.is_some() {
                server.delete_session().await;
            }
        }

        let forwarded = self.state >= SessionState::PortForwarded;
        if let Some(device) = self.device.take() {
            let session = self.session.as_ref();
            let default_ime = session.and_then(|s| s.default_ime.clone());
            if self.caps.unicode_keyboard() && self.caps.reset_keyboard.unwrap_or(false) {
                if let Some(ime) = default_ime {
                    debug!("Resetting IME to '{}'", ime);
                    teardown_step("reset IME", device.set_ime(&ime).await);
                }
            }

            let package = session
                .and_then(|s| s.launch.as_ref())
                .map(|l| l.package.clone())
                .or_else(|| self.caps.app_package.clone());
            if let Some(package) = package {
                teardown_step("force-stop app", device.force_stop(&package).await);
            }

            teardown_step("stop logcat", device.stop_logcat().await);

            if let (true, Some(port)) = (forwarded, session.map(|s| s.system_port)) {
                teardown_step("remove port forward", device.remove_port_forward(port).await);
            }

            let booted = session.and_then(|s| s.booted_emulator.clone());
            if let (true, Some(avd)) = (self.caps.reboot.unwrap_or(false), booted) {
                debug!("Closing emulator '{}'", avd);
                teardown_step("kill emulator", device.kill_emulator(&avd).await);
            }
        }

        if let Some(port) = self.claimed_port.take() {
            self.opts.ports.release(port);
        }

        if self.state != SessionState::Idle {
            self.state = SessionState::Deleted;
        }
    }

    /// Restart the session in place, keeping its id.
    pub async fn reset(&mut self) -> Result<(), ApiError> {
        info!("Running Selendroid reset");
        self.delete_session().await;
        let port = self.session()?.system_port;
        if !self.opts.ports.claim(port) {
            return Err(ApiError::environment(format!(
                "System port {} was taken by another session during reset",
                port
            )));
        }
        self.claimed_port = Some(port);
        self.start_selendroid_session().await
    }

    pub async fn close_app(&self) -> Result<(), ApiError> {
        let package = self.launch()?.package.clone();
        self.device()?.force_stop(&package).await?;
        Ok(())
    }

    /// AUT strings for `language`, or for the session language.
    pub async fn get_strings(&self, language: Option<&str>) -> Result<Map<String, Value>, ApiError> {
        let session = self.session()?;
        match language {
            Some(language) if Some(language) != self.caps.language.as_deref() => {
                let app = self.app_path()?;
                Ok(helpers::extract_strings(self.device()?.as_ref(), &app, Some(language)).await)
            }
            _ => Ok(session.apk_strings.clone()),
        }
    }

    /// Restart adb and forward the server port again after a lost connection.
    pub async fn reconnect_device(&self) -> Result<(), ApiError> {
        let device = self.device()?;
        let system_port = self.session()?.system_port;
        warn!("Lost the connection to the device, restarting adb");
        device.restart_adb().await?;
        device.forward_port(system_port, DEVICE_PORT).await?;
        Ok(())
    }

    pub async fn execute_command(
        &mut self,
        command: &str,
        params: CommandParams,
    ) -> Result<Value, ApiError> {
        let handler = self
            .commands
            .get(command)
            .ok_or_else(|| ApiError::unknown_command(command, ""))?;
        debug!("Executing command '{}'", command);
        handler(self, params).await
    }

    pub async fn forward(
        &self,
        method: HttpMethod,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, ApiError> {
        let proxy = self.proxy()?;
        match proxy.proxy_req_res(method, path, body).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let super::proxy::ProxyError::Transport { .. } = &e {
                    if let Err(reconnect) = self.reconnect_device().await {
                        warn!("Could not reconnect to the device: {}", reconnect);
                    }
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl SessionLifecycle for SelendroidDriver {
    async fn create_session(
        &mut self,
        caps: Map<String, Value>,
    ) -> Result<(String, Map<String, Value>), ApiError> {
        SelendroidDriver::create_session(self, caps).await
    }

    async fn delete_session(&mut self) {
        SelendroidDriver::delete_session(self).await
    }

    fn info(&self) -> Option<SessionInfo> {
        self.session.as_ref().map(Session::info)
    }

    fn proxy_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.proxy_active)
    }

    fn can_proxy(&self) -> bool {
        self.session.is_some()
    }

    fn proxy_avoid_list(&self) -> &'static [ProxyExclusion] {
        routes::proxy_avoid_list()
    }

    async fn execute(&mut self, command: &str, params: CommandParams) -> Result<Value, ApiError> {
        self.execute_command(command, params).await
    }

    async fn proxy_req_res(
        &self,
        method: HttpMethod,
        path: &str,
        body: Vec<u8>,
    ) -> Result<ProxiedResponse, ApiError> {
        self.forward(method, path, body).await
    }
}
