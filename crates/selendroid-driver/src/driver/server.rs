//! Per-app Selendroid server: repackage, sign, install and launch.
//!
//! The shared base server apk is bound to one application by rewriting the
//! package in its manifest (`selendroid.<appPackage>`) and repackaging it
//! into `<tmpDir>/selendroid.<appPackage>.apk`. The repackaged apk is reused
//! across sessions; builds for the same package are serialized through
//! [`BuildLocks`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use selendroid_core::error::ApiError;
use selendroid_core::protocol::HttpMethod;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::adb::DeviceControl;
use super::proxy::JsonWireProxy;
use super::retry::{retry_with, RetryPolicy};
use super::setup::ServerArtifacts;
use super::sync::BuildLocks;

/// Port the server listens on inside the device.
pub const DEVICE_PORT: u16 = 8080;

/// Instrumentation entry point inside the server apk.
pub const INSTRUMENTATION_CLASS: &str = "io.selendroid.server.ServerInstrumentation";

/// `/status` polling budget once instrumentation has been launched.
pub const STATUS_POLICY: RetryPolicy = RetryPolicy::new(20, Duration::from_secs(1));

/// Construction options. Every field is required.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub adb: Option<Arc<dyn DeviceControl>>,
    pub app_package: Option<String>,
    pub app_activity: Option<String>,
    pub tmp_dir: Option<PathBuf>,
    pub apk: Option<PathBuf>,
    pub host: Option<String>,
    pub system_port: Option<u16>,
    pub device_port: Option<u16>,
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::validation(format!("Option '{}' is required!", name)))
}

pub struct SelendroidServer {
    device: Arc<dyn DeviceControl>,
    app_package: String,
    app_activity: String,
    tmp_dir: PathBuf,
    apk: PathBuf,
    system_port: u16,
    device_port: u16,
    mod_server_pkg: String,
    mod_server_path: PathBuf,
    artifacts: ServerArtifacts,
    build_locks: BuildLocks,
    status_policy: RetryPolicy,
    proxy: Arc<JsonWireProxy>,
}

impl SelendroidServer {
    pub fn new(
        opts: ServerOptions,
        artifacts: ServerArtifacts,
        build_locks: BuildLocks,
    ) -> Result<Self, ApiError> {
        let device = required(opts.adb, "adb")?;
        let app_package = required(opts.app_package, "appPackage")?;
        let app_activity = required(opts.app_activity, "appActivity")?;
        let tmp_dir = required(opts.tmp_dir, "tmpDir")?;
        let apk = required(opts.apk, "apk")?;
        let host = required(opts.host, "host")?;
        let system_port = required(opts.system_port, "systemPort")?;
        let device_port = required(opts.device_port, "devicePort")?;

        let mod_server_pkg = format!("selendroid.{}", app_package);
        let mod_server_path = tmp_dir.join(format!("{}.apk", mod_server_pkg));

        Ok(Self {
            proxy: Arc::new(JsonWireProxy::new(&host, system_port)),
            device,
            app_package,
            app_activity,
            tmp_dir,
            apk,
            system_port,
            device_port,
            mod_server_pkg,
            mod_server_path,
            artifacts,
            build_locks,
            status_policy: STATUS_POLICY,
        })
    }

    pub fn with_status_policy(mut self, policy: RetryPolicy) -> Self {
        self.status_policy = policy;
        self
    }

    pub fn proxy(&self) -> &Arc<JsonWireProxy> {
        &self.proxy
    }

    pub fn mod_server_pkg(&self) -> &str {
        &self.mod_server_pkg
    }

    pub fn mod_server_path(&self) -> &Path {
        &self.mod_server_path
    }

    pub fn system_port(&self) -> u16 {
        self.system_port
    }

    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    /// Make sure a signed, app-specific server apk exists.
    ///
    /// Builds it if absent, then checks the signature of both the server
    /// and (unless `sign_app` is false) the AUT. A fresh build also removes
    /// any stale copy of the server package from the device.
    pub async fn prepare_modified_server(&self, sign_app: bool) -> Result<(), ApiError> {
        let _guard = self.build_locks.acquire(&self.app_package).await;

        let exists = tokio::fs::try_exists(&self.mod_server_path)
            .await
            .map_err(|e| {
                ApiError::environment(format!(
                    "Could not stat {}: {}",
                    self.mod_server_path.display(),
                    e
                ))
            })?;
        let fresh_build = if exists {
            debug!("Modified server exists at {}", self.mod_server_path.display());
            false
        } else {
            self.build_new_mod_server().await?;
            true
        };

        let sign_aut = async {
            if sign_app {
                self.check_and_sign_cert(&self.apk, &self.app_package).await
            } else {
                debug!("Not checking the app signature, noSign is set");
                Ok(false)
            }
        };
        tokio::try_join!(
            self.check_and_sign_cert(&self.mod_server_path, &self.mod_server_pkg),
            sign_aut,
        )?;

        if fresh_build {
            info!("New server was built, uninstalling any instances of it");
            self.device.uninstall_apk(&self.mod_server_pkg).await?;
        }
        Ok(())
    }

    /// Repackage the base server for this app package.
    pub async fn build_new_mod_server(&self) -> Result<(), ApiError> {
        info!(
            "Repackaging selendroid for: '{}' as '{}'",
            self.app_package, self.mod_server_pkg
        );
        let io_err = |what: &str, path: &Path, e: std::io::Error| {
            ApiError::environment(format!("Could not {} {}: {}", what, path.display(), e))
        };

        let work_dir = self.tmp_dir.join(&self.app_package);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| io_err("create", &work_dir, e))?;

        let manifest = work_dir.join(super::setup::MANIFEST_NAME);
        debug!("Creating new manifest: '{}'", manifest.display());
        tokio::fs::copy(&self.artifacts.manifest, &manifest)
            .await
            .map_err(|e| io_err("copy", &self.artifacts.manifest, e))?;

        self.device
            .compile_manifest(&manifest, &self.mod_server_pkg, &self.app_package)
            .await?;

        // Write beside the final path and rename so a half-built apk is never reused
        let partial = self
            .tmp_dir
            .join(format!("{}.apk.partial", self.mod_server_pkg));
        self.device
            .insert_manifest(&manifest, &self.artifacts.apk, &partial)
            .await?;
        tokio::fs::rename(&partial, &self.mod_server_path)
            .await
            .map_err(|e| io_err("move", &partial, e))?;

        info!("Wrote modified server to {}", self.mod_server_path.display());
        Ok(())
    }

    /// Sign `apk` if it is unsigned. Returns true when signing was needed.
    pub async fn check_and_sign_cert(&self, apk: &Path, package: &str) -> Result<bool, ApiError> {
        if self.device.check_apk_cert(apk, package).await? {
            debug!("{} is already signed", apk.display());
            return Ok(false);
        }
        info!("Signing {}", apk.display());
        self.device.sign(apk).await?;
        Ok(true)
    }

    pub async fn install_modified_server(&self) -> Result<(), ApiError> {
        if self.device.is_app_installed(&self.mod_server_pkg).await? {
            debug!("{} is already installed", self.mod_server_pkg);
            return Ok(());
        }
        info!("Installing {}", self.mod_server_path.display());
        self.device.install(&self.mod_server_path).await?;
        Ok(())
    }

    /// Launch the server and create its automation session.
    ///
    /// `POST /session` goes out only after `/status` has answered.
    pub async fn start_session(&self, caps: &Map<String, Value>) -> Result<Value, ApiError> {
        let component = format!("{}/{}", self.mod_server_pkg, INSTRUMENTATION_CLASS);
        info!("Starting selendroid server");
        self.device
            .instrument(&self.app_package, &self.app_activity, &component)
            .await?;

        info!("Waiting for Selendroid to be online...");
        retry_with(self.status_policy, || {
            self.proxy.command("/status", HttpMethod::Get, None)
        })
        .await
        .map_err(|e| {
            let attempts = e.attempts();
            ApiError::server_startup_timeout(attempts, &e.into_last().to_string())
        })?;

        info!("Selendroid server is online, starting session");
        let body = json!({ "desiredCapabilities": caps });
        let session = self
            .proxy
            .command("/session", HttpMethod::Post, Some(body))
            .await?;
        Ok(session)
    }

    /// Delete the remote session. Failures are logged only.
    pub async fn delete_session(&self) {
        debug!("Deleting Selendroid server session");
        if let Err(e) = self.proxy.command("/", HttpMethod::Delete, None).await {
            warn!(
                "Did not get confirmation selendroid deleteSession worked; error was: {}",
                e
            );
        }
        self.proxy.clear_session().await;
    }
}
