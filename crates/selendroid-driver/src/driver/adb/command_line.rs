//! `adb`/`aapt`/`apksigner` backed device control.
//!
//! Every operation is one or two tool invocations via
//! `tokio::process::Command`; output parsing lives in [`super::parse`].

use std::collections::VecDeque;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::parse;
use super::{
    AdbError, AvdLaunch, DeviceBridge, DeviceControl, DeviceEntry, DeviceHandle, LaunchInfo,
    LogEntry, StartAppOptions, DEFAULT_ADB_PORT,
};
use crate::driver::retry::retry_interval;

/// Timeout for ordinary tool invocations.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Installs of large apks on slow emulators take a while.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Cap on buffered logcat lines per device.
const MAX_LOG_ENTRIES: usize = 10_000;

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_AVD_LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_AVD_READY_TIMEOUT: Duration = Duration::from_secs(120);
const ACTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(750);

const LOCATION_SERVICE: &str = "io.appium.settings/.LocationService";

/// Where the Android and Java tools live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub adb: PathBuf,
    pub aapt: PathBuf,
    pub apksigner: PathBuf,
    pub emulator: PathBuf,
    pub java: PathBuf,
    pub jar: PathBuf,
    /// Platform jar `aapt package` links manifests against.
    pub android_jar: Option<PathBuf>,
    pub keystore: PathBuf,
}

impl ToolPaths {
    /// Resolve tools from `ANDROID_HOME` (or `ANDROID_SDK_ROOT`) and
    /// `JAVA_HOME`, falling back to bare names on `PATH`.
    pub fn from_env() -> Self {
        let sdk = env::var_os("ANDROID_HOME")
            .filter(|v| !v.is_empty())
            .or_else(|| env::var_os("ANDROID_SDK_ROOT").filter(|v| !v.is_empty()))
            .map(PathBuf::from);
        let java_bin = env::var_os("JAVA_HOME")
            .filter(|v| !v.is_empty())
            .map(|home| PathBuf::from(home).join("bin"));
        let keystore = dirs::home_dir()
            .unwrap_or_else(env::temp_dir)
            .join(".android")
            .join("debug.keystore");

        let java_tool = |name: &str| match &java_bin {
            Some(bin) => bin.join(name),
            None => PathBuf::from(name),
        };

        match sdk {
            Some(sdk) => {
                let build_tools = latest_version_dir(&sdk.join("build-tools"));
                let platform = latest_version_dir(&sdk.join("platforms"));
                let build_tool = |name: &str| match &build_tools {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                };
                Self {
                    adb: sdk.join("platform-tools").join("adb"),
                    aapt: build_tool("aapt"),
                    apksigner: build_tool("apksigner"),
                    emulator: sdk.join("emulator").join("emulator"),
                    java: java_tool("java"),
                    jar: java_tool("jar"),
                    android_jar: platform
                        .map(|p| p.join("android.jar"))
                        .filter(|p| p.exists()),
                    keystore,
                }
            }
            None => Self {
                adb: PathBuf::from("adb"),
                aapt: PathBuf::from("aapt"),
                apksigner: PathBuf::from("apksigner"),
                emulator: PathBuf::from("emulator"),
                java: java_tool("java"),
                jar: java_tool("jar"),
                android_jar: None,
                keystore,
            },
        }
    }
}

/// Highest-versioned subdirectory, e.g. `build-tools/33.0.2` or `platforms/android-33`.
fn latest_version_dir(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .max_by_key(|e| version_key(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
}

fn version_key(name: &str) -> Vec<u64> {
    name.split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Result of one tool invocation.
#[derive(Debug)]
struct ExecOutput {
    command: String,
    code: i32,
    stdout: String,
    stderr: String,
}

impl ExecOutput {
    fn checked(self) -> Result<Self, AdbError> {
        if self.code == 0 {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(AdbError::CommandFailed {
            command: self.command,
            code: self.code,
            stderr,
        })
    }
}

async fn exec(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ExecOutput, AdbError> {
    let command_line = format!("{} {}", program.display(), args.join(" "));
    debug!("Running: {}", command_line);

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result.map_err(|source| AdbError::Spawn {
            program: program.display().to_string(),
            source,
        })?,
        Err(_) => {
            return Err(AdbError::Timeout {
                command: command_line,
                timeout,
            })
        }
    };

    Ok(ExecOutput {
        command: command_line,
        // -1 when killed by a signal
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

struct LogcatCapture {
    child: Child,
    reader: JoinHandle<()>,
}

/// [`DeviceControl`] for one device through the adb command line.
pub struct AdbCommandLine {
    tools: Arc<ToolPaths>,
    handle: DeviceHandle,
    logcat: Mutex<Option<LogcatCapture>>,
    logs: Arc<StdMutex<VecDeque<LogEntry>>>,
}

impl AdbCommandLine {
    pub fn new(tools: Arc<ToolPaths>, handle: DeviceHandle) -> Self {
        Self {
            tools,
            handle,
            logcat: Mutex::new(None),
            logs: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    fn server_args(&self) -> Vec<String> {
        if self.handle.adb_port == DEFAULT_ADB_PORT {
            Vec::new()
        } else {
            vec!["-P".to_string(), self.handle.adb_port.to_string()]
        }
    }

    fn device_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = self.server_args();
        full.push("-s".to_string());
        full.push(self.handle.udid.clone());
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    async fn adb(&self, args: &[&str]) -> Result<String, AdbError> {
        let out = exec(
            &self.tools.adb,
            &self.device_args(args),
            None,
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?
        .checked()?;
        Ok(out.stdout)
    }

    async fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.adb(&full).await
    }

    async fn aapt(&self, args: Vec<String>, cwd: Option<&Path>) -> Result<String, AdbError> {
        let out = exec(&self.tools.aapt, &args, cwd, DEFAULT_EXEC_TIMEOUT)
            .await?
            .checked()?;
        Ok(out.stdout)
    }

    async fn getprop(&self, name: &str) -> Result<String, AdbError> {
        Ok(self.shell(&["getprop", name]).await?.trim().to_string())
    }

    async fn setting(&self, namespace: &str, key: &str) -> Result<bool, AdbError> {
        let out = self.shell(&["settings", "get", namespace, key]).await?;
        Ok(parse::parse_setting_flag(&out))
    }

    async fn focused_activity(&self) -> Result<Option<(String, String)>, AdbError> {
        let out = self.shell(&["dumpsys", "window", "windows"]).await?;
        Ok(parse::parse_focus(&out))
    }

    async fn wait_for_boot(&self, timeout: Duration) -> Result<(), AdbError> {
        let attempts = (timeout.as_millis() / BOOT_POLL_INTERVAL.as_millis()).max(1) as u32;
        retry_interval(attempts, BOOT_POLL_INTERVAL, || async {
            let booted = self.getprop("sys.boot_completed").await?;
            if booted == "1" {
                Ok(())
            } else {
                Err(AdbError::UnexpectedOutput {
                    command: "getprop sys.boot_completed".to_string(),
                    output: booted,
                })
            }
        })
        .await
        .map_err(|e| e.into_last())
    }
}

#[async_trait]
impl DeviceControl for AdbCommandLine {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    async fn install(&self, apk: &Path) -> Result<(), AdbError> {
        let apk = path_arg(apk);
        let out = exec(
            &self.tools.adb,
            &self.device_args(&["install", "-r", &apk]),
            None,
            INSTALL_TIMEOUT,
        )
        .await?
        .checked()?;
        // Older adb versions exit 0 on install failures
        if out.stdout.contains("Failure") {
            return Err(AdbError::CommandFailed {
                command: out.command,
                code: out.code,
                stderr: out.stdout.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn uninstall_apk(&self, package: &str) -> Result<(), AdbError> {
        let out = exec(
            &self.tools.adb,
            &self.device_args(&["uninstall", package]),
            None,
            INSTALL_TIMEOUT,
        )
        .await?;
        if out.code != 0 || out.stdout.contains("Failure") {
            debug!("'{}' was not uninstalled: {}", package, out.stdout.trim());
        }
        Ok(())
    }

    async fn is_app_installed(&self, package: &str) -> Result<bool, AdbError> {
        let out = self.shell(&["pm", "list", "packages", package]).await?;
        let wanted = format!("package:{}", package);
        Ok(out.lines().any(|line| line.trim() == wanted))
    }

    async fn clear_app_data(&self, package: &str) -> Result<(), AdbError> {
        self.shell(&["pm", "clear", package]).await.map(drop)
    }

    async fn force_stop(&self, package: &str) -> Result<(), AdbError> {
        self.shell(&["am", "force-stop", package]).await.map(drop)
    }

    async fn check_apk_cert(&self, apk: &Path, package: &str) -> Result<bool, AdbError> {
        debug!("Checking app cert for {} ({})", apk.display(), package);
        let out = exec(
            &self.tools.apksigner,
            &owned(&["verify", &path_arg(apk)]),
            None,
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?;
        Ok(out.code == 0)
    }

    async fn sign(&self, apk: &Path) -> Result<(), AdbError> {
        let args = owned(&[
            "sign",
            "--ks",
            &path_arg(&self.tools.keystore),
            "--ks-pass",
            "pass:android",
            "--ks-key-alias",
            "androiddebugkey",
            &path_arg(apk),
        ]);
        exec(&self.tools.apksigner, &args, None, DEFAULT_EXEC_TIMEOUT)
            .await?
            .checked()?;
        Ok(())
    }

    async fn compile_manifest(
        &self,
        manifest: &Path,
        new_package: &str,
        target_package: &str,
    ) -> Result<(), AdbError> {
        let android_jar = self
            .tools
            .android_jar
            .as_ref()
            .ok_or_else(|| AdbError::ToolMissing("android.jar".to_string()))?;
        let output = manifest.with_extension("apk");
        let args = owned(&[
            "package",
            "-M",
            &path_arg(manifest),
            "--rename-manifest-package",
            new_package,
            "--rename-instrumentation-target-package",
            target_package,
            "-I",
            &path_arg(android_jar),
            "-F",
            &path_arg(&output),
            "-f",
        ]);
        self.aapt(args, None).await.map(drop)
    }

    async fn insert_manifest(
        &self,
        manifest: &Path,
        src_apk: &Path,
        dst_apk: &Path,
    ) -> Result<(), AdbError> {
        let work_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        let compiled = manifest.with_extension("apk");

        // Swap the text manifest for the binary one aapt compiled
        exec(
            &self.tools.jar,
            &owned(&["xf", &path_arg(&compiled), "AndroidManifest.xml"]),
            Some(work_dir),
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?
        .checked()?;

        tokio::fs::copy(src_apk, dst_apk).await?;
        let dst = tokio::fs::canonicalize(dst_apk).await?;
        let dst = path_arg(&dst);

        self.aapt(owned(&["remove", &dst, "AndroidManifest.xml"]), Some(work_dir))
            .await?;
        self.aapt(owned(&["add", &dst, "AndroidManifest.xml"]), Some(work_dir))
            .await?;
        Ok(())
    }

    async fn has_internet_permission_from_manifest(&self, apk: &Path) -> Result<bool, AdbError> {
        let out = self
            .aapt(owned(&["dump", "permissions", &path_arg(apk)]), None)
            .await?;
        Ok(parse::has_internet_permission(&out))
    }

    async fn package_and_launch_activity_from_manifest(
        &self,
        apk: &Path,
    ) -> Result<LaunchInfo, AdbError> {
        let out = self
            .aapt(owned(&["dump", "badging", &path_arg(apk)]), None)
            .await?;
        Ok(parse::parse_badging(&out))
    }

    async fn extract_strings_from_apk(
        &self,
        apk: &Path,
        language: Option<&str>,
    ) -> Result<Map<String, Value>, AdbError> {
        let out = self
            .aapt(owned(&["dump", "--values", "resources", &path_arg(apk)]), None)
            .await?;
        Ok(parse::parse_string_resources(&out, language))
    }

    async fn instrument(
        &self,
        package: &str,
        activity: &str,
        component: &str,
    ) -> Result<(), AdbError> {
        let main_activity = format!("{}/{}", package, activity);
        let out = self
            .shell(&["am", "instrument", "-e", "main_activity", &main_activity, component])
            .await?;
        if out.contains("Exception") {
            return Err(AdbError::UnexpectedOutput {
                command: "am instrument".to_string(),
                output: out.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn start_app(&self, opts: &StartAppOptions) -> Result<(), AdbError> {
        let component = format!("{}/{}", opts.package, opts.activity);
        let mut args: Vec<&str> = vec!["am", "start", "-W", "-n", component.as_str()];
        if opts.stop_app {
            args.push("-S");
        }
        if let Some(action) = opts.action.as_deref() {
            args.extend(["-a", action]);
        }
        if let Some(category) = opts.category.as_deref() {
            args.extend(["-c", category]);
        }
        if let Some(flags) = opts.flags.as_deref() {
            args.extend(["-f", flags]);
        }
        if let Some(extra) = opts.optional_intent_arguments.as_deref() {
            args.extend(extra.split_whitespace());
        }

        let out = self.shell(&args).await?;
        if out.contains("Error:") {
            return Err(AdbError::UnexpectedOutput {
                command: "am start".to_string(),
                output: out.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn wait_for_activity(
        &self,
        package: &str,
        activity: &str,
        timeout: Duration,
    ) -> Result<(), AdbError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some((found_pkg, found_act)) = self.focused_activity().await? {
                if parse::activity_matches(package, activity, &found_pkg, &found_act) {
                    return Ok(());
                }
                debug!("Focused activity is {}/{}", found_pkg, found_act);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AdbError::Timeout {
                    command: format!("wait for {}/{}", package, activity),
                    timeout,
                });
            }
            tokio::time::sleep(ACTIVITY_POLL_INTERVAL).await;
        }
    }

    async fn forward_port(&self, local: u16, remote: u16) -> Result<(), AdbError> {
        let local = format!("tcp:{}", local);
        let remote = format!("tcp:{}", remote);
        self.adb(&["forward", &local, &remote]).await.map(drop)
    }

    async fn remove_port_forward(&self, local: u16) -> Result<(), AdbError> {
        let local = format!("tcp:{}", local);
        self.adb(&["forward", "--remove", &local]).await.map(drop)
    }

    async fn wait_for_device(&self) -> Result<(), AdbError> {
        self.adb(&["wait-for-device"]).await.map(drop)
    }

    async fn reboot(&self) -> Result<(), AdbError> {
        info!("Rebooting {}", self.handle.udid);
        self.adb(&["reboot"]).await?;
        self.wait_for_device().await?;
        self.wait_for_boot(DEFAULT_AVD_READY_TIMEOUT).await
    }

    async fn restart_adb(&self) -> Result<(), AdbError> {
        let mut kill = self.server_args();
        kill.push("kill-server".to_string());
        exec(&self.tools.adb, &kill, None, DEFAULT_EXEC_TIMEOUT).await?;

        let mut start = self.server_args();
        start.push("start-server".to_string());
        exec(&self.tools.adb, &start, None, DEFAULT_EXEC_TIMEOUT)
            .await?
            .checked()?;
        self.wait_for_device().await
    }

    async fn kill_emulator(&self, avd_name: &str) -> Result<(), AdbError> {
        info!("Killing emulator '{}' ({})", avd_name, self.handle.udid);
        self.adb(&["emu", "kill"]).await.map(drop)
    }

    async fn start_logcat(&self) -> Result<(), AdbError> {
        let mut slot = self.logcat.lock().await;
        if slot.is_some() {
            warn!("Logcat capture already running for {}", self.handle.udid);
            return Ok(());
        }

        let args = self.device_args(&["logcat", "-v", "threadtime"]);
        let mut child = Command::new(&self.tools.adb)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AdbError::Spawn {
                program: self.tools.adb.display().to_string(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| AdbError::UnexpectedOutput {
            command: "adb logcat".to_string(),
            output: "stdout was not captured".to_string(),
        })?;

        let logs = Arc::clone(&self.logs);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let now = chrono::Utc::now().timestamp_millis();
                if let Some(entry) = parse::parse_logcat_line(&line, now) {
                    let mut buf = logs.lock().unwrap_or_else(PoisonError::into_inner);
                    if buf.len() >= MAX_LOG_ENTRIES {
                        buf.pop_front();
                    }
                    buf.push_back(entry);
                }
            }
        });

        debug!("Started logcat capture for {}", self.handle.udid);
        *slot = Some(LogcatCapture { child, reader });
        Ok(())
    }

    async fn stop_logcat(&self) -> Result<(), AdbError> {
        let Some(mut capture) = self.logcat.lock().await.take() else {
            return Ok(());
        };
        capture.reader.abort();
        capture.child.kill().await?;
        debug!("Stopped logcat capture for {}", self.handle.udid);
        Ok(())
    }

    async fn logcat_logs(&self) -> Result<Vec<LogEntry>, AdbError> {
        let mut buf = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(buf.drain(..).collect())
    }

    async fn get_device_language(&self) -> Result<String, AdbError> {
        let language = self.getprop("persist.sys.language").await?;
        if !language.is_empty() {
            return Ok(language);
        }
        self.getprop("ro.product.locale.language").await
    }

    async fn set_device_language(&self, language: &str) -> Result<(), AdbError> {
        self.shell(&["setprop", "persist.sys.language", language])
            .await
            .map(drop)
    }

    async fn get_device_country(&self) -> Result<String, AdbError> {
        let country = self.getprop("persist.sys.country").await?;
        if !country.is_empty() {
            return Ok(country);
        }
        self.getprop("ro.product.locale.region").await
    }

    async fn set_device_country(&self, country: &str) -> Result<(), AdbError> {
        self.shell(&["setprop", "persist.sys.country", country])
            .await
            .map(drop)
    }

    async fn default_ime(&self) -> Result<Option<String>, AdbError> {
        let out = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?;
        let ime = out.trim();
        if ime.is_empty() || ime == "null" {
            Ok(None)
        } else {
            Ok(Some(ime.to_string()))
        }
    }

    async fn available_imes(&self) -> Result<Vec<String>, AdbError> {
        let out = self.shell(&["ime", "list", "-s"]).await?;
        Ok(parse::parse_lines(&out))
    }

    async fn enable_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.shell(&["ime", "enable", ime]).await.map(drop)
    }

    async fn disable_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.shell(&["ime", "disable", ime]).await.map(drop)
    }

    async fn set_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.shell(&["ime", "set", ime]).await.map(drop)
    }

    async fn keyevent(&self, keycode: i64) -> Result<(), AdbError> {
        let code = keycode.to_string();
        self.shell(&["input", "keyevent", &code]).await.map(drop)
    }

    async fn unlock(&self) -> Result<(), AdbError> {
        // KEYCODE_MENU dismisses the keyguard on unsecured devices
        self.keyevent(82).await
    }

    async fn is_airplane_mode_on(&self) -> Result<bool, AdbError> {
        self.setting("global", "airplane_mode_on").await
    }

    async fn set_airplane_mode(&self, on: bool) -> Result<(), AdbError> {
        let value = if on { "1" } else { "0" };
        self.shell(&["settings", "put", "global", "airplane_mode_on", value])
            .await?;
        let state = if on { "true" } else { "false" };
        self.shell(&[
            "am",
            "broadcast",
            "-a",
            "android.intent.action.AIRPLANE_MODE",
            "--ez",
            "state",
            state,
        ])
        .await
        .map(drop)
    }

    async fn is_wifi_on(&self) -> Result<bool, AdbError> {
        self.setting("global", "wifi_on").await
    }

    async fn set_wifi(&self, on: bool) -> Result<(), AdbError> {
        let action = if on { "enable" } else { "disable" };
        self.shell(&["svc", "wifi", action]).await.map(drop)
    }

    async fn is_data_on(&self) -> Result<bool, AdbError> {
        self.setting("global", "mobile_data").await
    }

    async fn set_data(&self, on: bool) -> Result<(), AdbError> {
        let action = if on { "enable" } else { "disable" };
        self.shell(&["svc", "data", action]).await.map(drop)
    }

    async fn set_geolocation(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
    ) -> Result<(), AdbError> {
        let longitude = longitude.to_string();
        let latitude = latitude.to_string();
        let altitude = altitude.map(|a| a.to_string());
        let mut args = vec![
            "am",
            "startservice",
            "-e",
            "longitude",
            longitude.as_str(),
            "-e",
            "latitude",
            latitude.as_str(),
        ];
        if let Some(altitude) = altitude.as_deref() {
            args.extend(["-e", "altitude", altitude]);
        }
        args.push(LOCATION_SERVICE);
        self.shell(&args).await.map(drop)
    }

    async fn webview_contexts(&self) -> Result<Vec<String>, AdbError> {
        let out = self.shell(&["cat", "/proc/net/unix"]).await?;
        Ok(parse::parse_webview_sockets(&out))
    }
}

/// [`DeviceBridge`] over the host's `adb`, `emulator` and `java`.
pub struct AdbBridge {
    tools: Arc<ToolPaths>,
    adb_port: u16,
}

impl AdbBridge {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools: Arc::new(tools),
            adb_port: DEFAULT_ADB_PORT,
        }
    }

    pub fn with_adb_port(mut self, port: u16) -> Self {
        self.adb_port = port;
        self
    }

    fn server_args(&self) -> Vec<String> {
        if self.adb_port == DEFAULT_ADB_PORT {
            Vec::new()
        } else {
            vec!["-P".to_string(), self.adb_port.to_string()]
        }
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, AdbError> {
        let mut args = self.server_args();
        args.push("devices".to_string());
        let out = exec(&self.tools.adb, &args, None, DEFAULT_EXEC_TIMEOUT)
            .await?
            .checked()?;
        Ok(parse::parse_devices(&out.stdout)
            .into_iter()
            .filter(|d| d.state == "device")
            .collect())
    }

    fn bind(&self, device: DeviceHandle) -> Arc<dyn DeviceControl> {
        Arc::new(AdbCommandLine::new(Arc::clone(&self.tools), device))
    }

    async fn get_running_avd(&self, avd_name: &str) -> Result<Option<String>, AdbError> {
        for device in self.list_devices().await? {
            if parse::emulator_port(&device.udid).is_none() {
                continue;
            }
            let mut args = self.server_args();
            args.extend(owned(&["-s", &device.udid, "emu", "avd", "name"]));
            let out = exec(&self.tools.adb, &args, None, DEFAULT_EXEC_TIMEOUT).await?;
            let running = out.stdout.lines().next().map(str::trim).unwrap_or_default();
            if running == avd_name {
                return Ok(Some(device.udid));
            }
        }
        Ok(None)
    }

    async fn launch_avd(&self, launch: &AvdLaunch) -> Result<(), AdbError> {
        info!("Launching emulator '{}'", launch.name);
        let mut args = owned(&["-avd", &launch.name]);
        if let Some(language) = launch.language.as_deref() {
            args.push("-prop".to_string());
            args.push(format!("persist.sys.language={}", language));
        }
        if let Some(country) = launch.country.as_deref() {
            args.push("-prop".to_string());
            args.push(format!("persist.sys.country={}", country));
        }
        if let Some(extra) = launch.args.as_deref() {
            args.extend(extra.split_whitespace().map(str::to_string));
        }

        // The emulator outlives this call; it is stopped with `emu kill`.
        Command::new(&self.tools.emulator)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| AdbError::Spawn {
                program: self.tools.emulator.display().to_string(),
                source,
            })?;

        let launch_timeout = launch.launch_timeout.unwrap_or(DEFAULT_AVD_LAUNCH_TIMEOUT);
        let attempts = (launch_timeout.as_millis() / BOOT_POLL_INTERVAL.as_millis()).max(1) as u32;
        let udid = retry_interval(attempts, BOOT_POLL_INTERVAL, || async {
            self.get_running_avd(&launch.name)
                .await?
                .ok_or_else(|| AdbError::UnexpectedOutput {
                    command: "adb devices".to_string(),
                    output: format!("emulator '{}' is not running yet", launch.name),
                })
        })
        .await
        .map_err(|e| e.into_last())?;

        let device = AdbCommandLine::new(
            Arc::clone(&self.tools),
            DeviceHandle::new(udid).with_adb_port(self.adb_port),
        );
        device
            .wait_for_boot(launch.ready_timeout.unwrap_or(DEFAULT_AVD_READY_TIMEOUT))
            .await
    }

    async fn java_version_output(&self) -> Result<String, AdbError> {
        let out = exec(
            &self.tools.java,
            &owned(&["-version"]),
            None,
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?
        .checked()?;
        // java prints its version banner on stderr
        Ok(format!("{}{}", out.stderr, out.stdout))
    }
}
