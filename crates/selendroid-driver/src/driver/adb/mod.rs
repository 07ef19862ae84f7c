//! Device control seam.
//!
//! [`DeviceControl`] is everything the driver asks of one Android device,
//! [`DeviceBridge`] is everything it asks of the host's Android tooling
//! before a device is chosen. [`AdbCommandLine`] and [`AdbBridge`] are the
//! real implementations, which shell out to `adb`, `aapt`, `apksigner` and
//! `emulator`.

mod command_line;
pub mod parse;

pub use command_line::{AdbBridge, AdbCommandLine, ToolPaths};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use selendroid_core::error::ApiError;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default adb server port.
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// A connected device and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub udid: String,
    pub emulator_port: Option<u16>,
    pub adb_port: u16,
}

impl DeviceHandle {
    pub fn new(udid: impl Into<String>) -> Self {
        let udid = udid.into();
        let emulator_port = parse::emulator_port(&udid);
        Self {
            udid,
            emulator_port,
            adb_port: DEFAULT_ADB_PORT,
        }
    }

    pub fn with_adb_port(mut self, port: u16) -> Self {
        self.adb_port = port;
        self
    }
}

/// One line of `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub udid: String,
    pub state: String,
}

/// Package and launchable activity read from an apk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchInfo {
    pub package: Option<String>,
    pub activity: Option<String>,
}

/// Arguments for `am start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartAppOptions {
    pub package: String,
    pub activity: String,
    pub wait_package: Option<String>,
    pub wait_activity: Option<String>,
    pub action: Option<String>,
    pub category: Option<String>,
    pub flags: Option<String>,
    pub optional_intent_arguments: Option<String>,
    /// Force-stop the app before starting it.
    pub stop_app: bool,
}

/// A captured logcat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

/// Emulator boot parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvdLaunch {
    pub name: String,
    pub args: Option<String>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub launch_timeout: Option<Duration>,
    pub ready_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("unexpected output from '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("{0} not found; set ANDROID_HOME to your Android SDK")]
    ToolMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AdbError> for ApiError {
    fn from(err: AdbError) -> Self {
        match err {
            AdbError::Spawn { .. } | AdbError::ToolMissing(_) => {
                ApiError::environment(err.to_string())
            }
            other => ApiError::command_failed(other.to_string()),
        }
    }
}

/// Operations on one device, keyed by package name and apk path.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    fn handle(&self) -> &DeviceHandle;

    // Packages
    async fn install(&self, apk: &Path) -> Result<(), AdbError>;
    async fn uninstall_apk(&self, package: &str) -> Result<(), AdbError>;
    async fn is_app_installed(&self, package: &str) -> Result<bool, AdbError>;
    async fn clear_app_data(&self, package: &str) -> Result<(), AdbError>;
    async fn force_stop(&self, package: &str) -> Result<(), AdbError>;

    // Signing and repackaging
    /// True when the apk is already signed.
    async fn check_apk_cert(&self, apk: &Path, package: &str) -> Result<bool, AdbError>;
    async fn sign(&self, apk: &Path) -> Result<(), AdbError>;
    async fn compile_manifest(
        &self,
        manifest: &Path,
        new_package: &str,
        target_package: &str,
    ) -> Result<(), AdbError>;
    async fn insert_manifest(
        &self,
        manifest: &Path,
        src_apk: &Path,
        dst_apk: &Path,
    ) -> Result<(), AdbError>;

    // Manifest inspection
    async fn has_internet_permission_from_manifest(&self, apk: &Path) -> Result<bool, AdbError>;
    async fn package_and_launch_activity_from_manifest(
        &self,
        apk: &Path,
    ) -> Result<LaunchInfo, AdbError>;
    async fn extract_strings_from_apk(
        &self,
        apk: &Path,
        language: Option<&str>,
    ) -> Result<Map<String, Value>, AdbError>;

    // Instrumentation and activities
    async fn instrument(&self, package: &str, activity: &str, component: &str)
        -> Result<(), AdbError>;
    async fn start_app(&self, opts: &StartAppOptions) -> Result<(), AdbError>;
    async fn wait_for_activity(
        &self,
        package: &str,
        activity: &str,
        timeout: Duration,
    ) -> Result<(), AdbError>;

    // Connectivity and lifecycle
    async fn forward_port(&self, local: u16, remote: u16) -> Result<(), AdbError>;
    async fn remove_port_forward(&self, local: u16) -> Result<(), AdbError>;
    async fn wait_for_device(&self) -> Result<(), AdbError>;
    async fn reboot(&self) -> Result<(), AdbError>;
    async fn restart_adb(&self) -> Result<(), AdbError>;
    async fn kill_emulator(&self, avd_name: &str) -> Result<(), AdbError>;

    // Logs
    async fn start_logcat(&self) -> Result<(), AdbError>;
    async fn stop_logcat(&self) -> Result<(), AdbError>;
    async fn logcat_logs(&self) -> Result<Vec<LogEntry>, AdbError>;

    // Locale
    async fn get_device_language(&self) -> Result<String, AdbError>;
    async fn set_device_language(&self, language: &str) -> Result<(), AdbError>;
    async fn get_device_country(&self) -> Result<String, AdbError>;
    async fn set_device_country(&self, country: &str) -> Result<(), AdbError>;

    // Input methods
    async fn default_ime(&self) -> Result<Option<String>, AdbError>;
    async fn available_imes(&self) -> Result<Vec<String>, AdbError>;
    async fn enable_ime(&self, ime: &str) -> Result<(), AdbError>;
    async fn disable_ime(&self, ime: &str) -> Result<(), AdbError>;
    async fn set_ime(&self, ime: &str) -> Result<(), AdbError>;

    // Keys
    async fn keyevent(&self, keycode: i64) -> Result<(), AdbError>;
    async fn unlock(&self) -> Result<(), AdbError>;

    // Network state
    async fn is_airplane_mode_on(&self) -> Result<bool, AdbError>;
    async fn set_airplane_mode(&self, on: bool) -> Result<(), AdbError>;
    async fn is_wifi_on(&self) -> Result<bool, AdbError>;
    async fn set_wifi(&self, on: bool) -> Result<(), AdbError>;
    async fn is_data_on(&self) -> Result<bool, AdbError>;
    async fn set_data(&self, on: bool) -> Result<(), AdbError>;

    async fn set_geolocation(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
    ) -> Result<(), AdbError>;

    /// Webview context names for the devtools sockets open on the device.
    async fn webview_contexts(&self) -> Result<Vec<String>, AdbError>;
}

/// Host-side Android tooling: device discovery, emulators and the JVM.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, AdbError>;

    fn bind(&self, device: DeviceHandle) -> Arc<dyn DeviceControl>;

    /// Udid of the running emulator for `avd_name`, if any.
    async fn get_running_avd(&self, avd_name: &str) -> Result<Option<String>, AdbError>;

    async fn launch_avd(&self, launch: &AvdLaunch) -> Result<(), AdbError>;

    /// Raw output of `java -version`.
    async fn java_version_output(&self) -> Result<String, AdbError>;
}
