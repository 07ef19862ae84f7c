//! In-memory device, bridge and Selendroid server for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Map, Value};

use super::adb::{
    AdbError, AvdLaunch, DeviceBridge, DeviceControl, DeviceEntry, DeviceHandle, LaunchInfo,
    LogEntry, StartAppOptions,
};

struct DeviceState {
    calls: Vec<(String, Vec<String>)>,
    failing: HashSet<String>,
    installed: HashSet<String>,
    signed: bool,
    internet: bool,
    launch_info: LaunchInfo,
    language: String,
    country: String,
    default_ime: Option<String>,
    imes: Vec<String>,
    activity_ready: bool,
    webviews: Vec<String>,
    airplane: bool,
    wifi: bool,
    data: bool,
    logs: Vec<LogEntry>,
}

/// A device that records every call and answers from canned state.
pub struct FakeDevice {
    handle: DeviceHandle,
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    pub fn new(udid: &str) -> Self {
        Self {
            handle: DeviceHandle::new(udid),
            state: Mutex::new(DeviceState {
                calls: Vec::new(),
                failing: HashSet::new(),
                installed: HashSet::new(),
                signed: true,
                internet: true,
                launch_info: LaunchInfo {
                    package: Some("io.selendroid.testapp".into()),
                    activity: Some(".HomeScreenActivity".into()),
                },
                language: "en".into(),
                country: "US".into(),
                default_ime: Some("com.android.inputmethod.latin/.LatinIME".into()),
                imes: vec!["com.android.inputmethod.latin/.LatinIME".into()],
                activity_ready: true,
                webviews: Vec::new(),
                airplane: false,
                wifi: true,
                data: true,
                logs: vec![LogEntry {
                    timestamp: 1,
                    level: "INFO".into(),
                    message: "I/ActivityManager: Start proc".into(),
                }],
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    fn record(&self, name: &str, args: &[&str]) -> Result<(), AdbError> {
        let mut state = self.state();
        state.calls.push((
            name.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
        ));
        if state.failing.contains(name) {
            return Err(AdbError::CommandFailed {
                command: name.to_string(),
                code: 1,
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    /// Names of all calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|(n, _)| n == name).count()
    }

    pub fn called_with(&self, name: &str, arg: &str) -> bool {
        self.state()
            .calls
            .iter()
            .any(|(n, args)| n == name && args.iter().any(|a| a == arg))
    }

    /// Index of the first call to `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.state().calls.iter().position(|(n, _)| n == name)
    }

    pub fn fail(&self, name: &str) {
        self.state().failing.insert(name.to_string());
    }

    pub fn mark_installed(&self, package: &str) {
        self.state().installed.insert(package.to_string());
    }

    pub fn set_signed(&self, signed: bool) {
        self.state().signed = signed;
    }

    pub fn set_internet_permission(&self, granted: bool) {
        self.state().internet = granted;
    }

    pub fn set_activity_ready(&self, ready: bool) {
        self.state().activity_ready = ready;
    }

    pub fn set_webviews(&self, webviews: &[&str]) {
        self.state().webviews = webviews.iter().map(|w| w.to_string()).collect();
    }

    pub fn network(&self) -> (bool, bool, bool) {
        let state = self.state();
        (state.airplane, state.wifi, state.data)
    }
}

#[async_trait]
impl DeviceControl for FakeDevice {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    async fn install(&self, apk: &Path) -> Result<(), AdbError> {
        self.record("install", &[apk.display().to_string().as_str()])
    }

    async fn uninstall_apk(&self, package: &str) -> Result<(), AdbError> {
        self.record("uninstall_apk", &[package])?;
        self.state().installed.remove(package);
        Ok(())
    }

    async fn is_app_installed(&self, package: &str) -> Result<bool, AdbError> {
        self.record("is_app_installed", &[package])?;
        Ok(self.state().installed.contains(package))
    }

    async fn clear_app_data(&self, package: &str) -> Result<(), AdbError> {
        self.record("clear_app_data", &[package])
    }

    async fn force_stop(&self, package: &str) -> Result<(), AdbError> {
        self.record("force_stop", &[package])
    }

    async fn check_apk_cert(&self, apk: &Path, package: &str) -> Result<bool, AdbError> {
        self.record("check_apk_cert", &[apk.display().to_string().as_str(), package])?;
        Ok(self.state().signed)
    }

    async fn sign(&self, apk: &Path) -> Result<(), AdbError> {
        self.record("sign", &[apk.display().to_string().as_str()])
    }

    async fn compile_manifest(
        &self,
        manifest: &Path,
        new_package: &str,
        target_package: &str,
    ) -> Result<(), AdbError> {
        self.record(
            "compile_manifest",
            &[manifest.display().to_string().as_str(), new_package, target_package],
        )
    }

    async fn insert_manifest(
        &self,
        manifest: &Path,
        src_apk: &Path,
        dst_apk: &Path,
    ) -> Result<(), AdbError> {
        self.record(
            "insert_manifest",
            &[
                manifest.display().to_string().as_str(),
                src_apk.display().to_string().as_str(),
                dst_apk.display().to_string().as_str(),
            ],
        )?;
        // Give builds a little time so concurrent callers overlap
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(dst_apk, b"repackaged")?;
        Ok(())
    }

    async fn has_internet_permission_from_manifest(&self, apk: &Path) -> Result<bool, AdbError> {
        self.record(
            "has_internet_permission_from_manifest",
            &[apk.display().to_string().as_str()],
        )?;
        Ok(self.state().internet)
    }

    async fn package_and_launch_activity_from_manifest(
        &self,
        apk: &Path,
    ) -> Result<LaunchInfo, AdbError> {
        self.record(
            "package_and_launch_activity_from_manifest",
            &[apk.display().to_string().as_str()],
        )?;
        Ok(self.state().launch_info.clone())
    }

    async fn extract_strings_from_apk(
        &self,
        apk: &Path,
        language: Option<&str>,
    ) -> Result<Map<String, Value>, AdbError> {
        self.record(
            "extract_strings_from_apk",
            &[apk.display().to_string().as_str(), language.unwrap_or("")],
        )?;
        let mut strings = Map::new();
        strings.insert("hello_world".into(), json!("Hello World!"));
        Ok(strings)
    }

    async fn instrument(
        &self,
        package: &str,
        activity: &str,
        component: &str,
    ) -> Result<(), AdbError> {
        self.record("instrument", &[package, activity, component])
    }

    async fn start_app(&self, opts: &StartAppOptions) -> Result<(), AdbError> {
        self.record("start_app", &[opts.package.as_str(), opts.activity.as_str()])
    }

    async fn wait_for_activity(
        &self,
        package: &str,
        activity: &str,
        _timeout: Duration,
    ) -> Result<(), AdbError> {
        self.record("wait_for_activity", &[package, activity])?;
        if self.state().activity_ready {
            Ok(())
        } else {
            Err(AdbError::UnexpectedOutput {
                command: "dumpsys window windows".into(),
                output: "mCurrentFocus=null".into(),
            })
        }
    }

    async fn forward_port(&self, local: u16, remote: u16) -> Result<(), AdbError> {
        self.record("forward_port", &[local.to_string().as_str(), remote.to_string().as_str()])
    }

    async fn remove_port_forward(&self, local: u16) -> Result<(), AdbError> {
        self.record("remove_port_forward", &[local.to_string().as_str()])
    }

    async fn wait_for_device(&self) -> Result<(), AdbError> {
        self.record("wait_for_device", &[])
    }

    async fn reboot(&self) -> Result<(), AdbError> {
        self.record("reboot", &[])
    }

    async fn restart_adb(&self) -> Result<(), AdbError> {
        self.record("restart_adb", &[])
    }

    async fn kill_emulator(&self, avd_name: &str) -> Result<(), AdbError> {
        self.record("kill_emulator", &[avd_name])
    }

    async fn start_logcat(&self) -> Result<(), AdbError> {
        self.record("start_logcat", &[])
    }

    async fn stop_logcat(&self) -> Result<(), AdbError> {
        self.record("stop_logcat", &[])
    }

    async fn logcat_logs(&self) -> Result<Vec<LogEntry>, AdbError> {
        self.record("logcat_logs", &[])?;
        Ok(self.state().logs.clone())
    }

    async fn get_device_language(&self) -> Result<String, AdbError> {
        self.record("get_device_language", &[])?;
        Ok(self.state().language.clone())
    }

    async fn set_device_language(&self, language: &str) -> Result<(), AdbError> {
        self.record("set_device_language", &[language])?;
        self.state().language = language.to_string();
        Ok(())
    }

    async fn get_device_country(&self) -> Result<String, AdbError> {
        self.record("get_device_country", &[])?;
        Ok(self.state().country.clone())
    }

    async fn set_device_country(&self, country: &str) -> Result<(), AdbError> {
        self.record("set_device_country", &[country])?;
        self.state().country = country.to_string();
        Ok(())
    }

    async fn default_ime(&self) -> Result<Option<String>, AdbError> {
        self.record("default_ime", &[])?;
        Ok(self.state().default_ime.clone())
    }

    async fn available_imes(&self) -> Result<Vec<String>, AdbError> {
        self.record("available_imes", &[])?;
        Ok(self.state().imes.clone())
    }

    async fn enable_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.record("enable_ime", &[ime])?;
        let mut state = self.state();
        if !state.imes.iter().any(|i| i == ime) {
            state.imes.push(ime.to_string());
        }
        Ok(())
    }

    async fn disable_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.record("disable_ime", &[ime])?;
        self.state().imes.retain(|i| i != ime);
        Ok(())
    }

    async fn set_ime(&self, ime: &str) -> Result<(), AdbError> {
        self.record("set_ime", &[ime])?;
        self.state().default_ime = Some(ime.to_string());
        Ok(())
    }

    async fn keyevent(&self, keycode: i64) -> Result<(), AdbError> {
        self.record("keyevent", &[keycode.to_string().as_str()])
    }

    async fn unlock(&self) -> Result<(), AdbError> {
        self.record("unlock", &[])
    }

    async fn is_airplane_mode_on(&self) -> Result<bool, AdbError> {
        self.record("is_airplane_mode_on", &[])?;
        Ok(self.state().airplane)
    }

    async fn set_airplane_mode(&self, on: bool) -> Result<(), AdbError> {
        self.record("set_airplane_mode", &[on.to_string().as_str()])?;
        self.state().airplane = on;
        Ok(())
    }

    async fn is_wifi_on(&self) -> Result<bool, AdbError> {
        self.record("is_wifi_on", &[])?;
        Ok(self.state().wifi)
    }

    async fn set_wifi(&self, on: bool) -> Result<(), AdbError> {
        self.record("set_wifi", &[on.to_string().as_str()])?;
        self.state().wifi = on;
        Ok(())
    }

    async fn is_data_on(&self) -> Result<bool, AdbError> {
        self.record("is_data_on", &[])?;
        Ok(self.state().data)
    }

    async fn set_data(&self, on: bool) -> Result<(), AdbError> {
        self.record("set_data", &[on.to_string().as_str()])?;
        self.state().data = on;
        Ok(())
    }

    async fn set_geolocation(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
    ) -> Result<(), AdbError> {
        let altitude = altitude.map(|a| a.to_string()).unwrap_or_default();
        self.record(
            "set_geolocation",
            &[
                latitude.to_string().as_str(),
                longitude.to_string().as_str(),
                altitude.as_str(),
            ],
        )
    }

    async fn webview_contexts(&self) -> Result<Vec<String>, AdbError> {
        self.record("webview_contexts", &[])?;
        Ok(self.state().webviews.clone())
    }
}

/// A host with one shared [`FakeDevice`].
pub struct FakeBridge {
    device: Arc<FakeDevice>,
    devices: Mutex<Vec<String>>,
    java_output: Mutex<Option<String>>,
    running_avd: Mutex<Option<String>>,
    launched: Mutex<Vec<String>>,
}

impl FakeBridge {
    pub fn new(device: FakeDevice) -> Self {
        let udid = device.handle.udid.clone();
        Self {
            device: Arc::new(device),
            devices: Mutex::new(vec![udid]),
            java_output: Mutex::new(Some(
                "java version \"1.8.0_40\"\nJava(TM) SE Runtime Environment".into(),
            )),
            running_avd: Mutex::new(None),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> Arc<FakeDevice> {
        self.device.clone()
    }

    pub fn set_devices(&self, udids: &[&str]) {
        *self.devices.lock().unwrap() = udids.iter().map(|u| u.to_string()).collect();
    }

    pub fn set_java_output(&self, output: Option<&str>) {
        *self.java_output.lock().unwrap() = output.map(str::to_string);
    }

    pub fn set_running_avd(&self, udid: Option<&str>) {
        *self.running_avd.lock().unwrap() = udid.map(str::to_string);
    }

    pub fn launched_avds(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for FakeBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceEntry>, AdbError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|udid| DeviceEntry {
                udid: udid.clone(),
                state: "device".into(),
            })
            .collect())
    }

    fn bind(&self, _device: DeviceHandle) -> Arc<dyn DeviceControl> {
        self.device.clone()
    }

    async fn get_running_avd(&self, _avd_name: &str) -> Result<Option<String>, AdbError> {
        Ok(self.running_avd.lock().unwrap().clone())
    }

    async fn launch_avd(&self, launch: &AvdLaunch) -> Result<(), AdbError> {
        self.launched.lock().unwrap().push(launch.name.clone());
        Ok(())
    }

    async fn java_version_output(&self) -> Result<String, AdbError> {
        self.java_output
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AdbError::Spawn {
                program: "java".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
    }
}

struct ServerState {
    status_failures: AtomicU32,
    window_failures: AtomicU32,
    requests: Mutex<Vec<String>>,
    bodies: Mutex<Vec<(String, Value)>>,
}

/// A Selendroid server on `127.0.0.1:<random>` answering the calls the
/// driver makes. `/status` fails `status_failures` times before answering;
/// `POST /window` fails as often as [`FakeSelendroid::fail_window`] asks.
pub struct FakeSelendroid {
    state: Arc<ServerState>,
    port: u16,
}

const SESSION_PREFIX: &str = "/wd/hub/session/remote-1";
const OK_NULL: &str = r#"{"status":0,"value":null,"sessionId":"remote-1"}"#;

impl FakeSelendroid {
    pub async fn start(status_failures: u32) -> Self {
        let state = Arc::new(ServerState {
            status_failures: AtomicU32::new(status_failures),
            window_failures: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(handle_request)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { state, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Make the next `times` context switches fail.
    pub fn fail_window(&self, times: u32) {
        self.state.window_failures.store(times, Ordering::SeqCst);
    }

    pub fn count(&self, request: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == request)
            .count()
    }

    /// `"METHOD /path"` for every request received.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    /// JSON body of the most recent request matching `"METHOD /path"`.
    pub fn body_of(&self, request: &str) -> Option<Value> {
        self.state
            .bodies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _)| r == request)
            .map(|(_, body)| body.clone())
    }

    /// Bodies sent to `POST /session`.
    pub fn session_payloads(&self) -> Vec<Value> {
        self.state
            .bodies
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == "POST /wd/hub/session")
            .map(|(_, body)| body.clone())
            .collect()
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn ok_value(value: Value) -> Response {
    let body = json!({"status": 0, "value": value, "sessionId": "remote-1"});
    json_response(StatusCode::OK, body.to_string())
}

/// Use up one injected failure, if any are left.
fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn handle_request(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let request = format!("{} {}", method, path);
    state.requests.lock().unwrap().push(request.clone());
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    if method == Method::POST {
        state.bodies.lock().unwrap().push((request, body.clone()));
    }

    if path == "/wd/hub/status" {
        if take_failure(&state.status_failures) {
            return (StatusCode::INTERNAL_SERVER_ERROR, "starting").into_response();
        }
        return json_response(
            StatusCode::OK,
            json!({"status": 0, "value": {"build": {"version": "0.17.0"}}}).to_string(),
        );
    }

    if method == Method::POST && path == "/wd/hub/session" {
        let caps = body.get("desiredCapabilities").cloned().unwrap_or(Value::Null);
        return ok_value(caps);
    }

    let Some(command) = path.strip_prefix(SESSION_PREFIX) else {
        return json_response(
            StatusCode::NOT_FOUND,
            json!({"status": 6, "value": {"message": "no such session"}}).to_string(),
        );
    };

    match (method.as_str(), command) {
        ("GET", "/window_handles") => ok_value(json!(["NATIVE_APP", "WEBVIEW_0"])),
        ("GET", c) if c.starts_with("/element/missing/") => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": 7, "value": {"message": "An element could not be located: no such element"}})
                .to_string(),
        ),
        ("GET", c) if c.ends_with("/location") => ok_value(json!({"x": 10, "y": 20})),
        ("GET", c) if c.ends_with("/size") => ok_value(json!({"width": 100, "height": 50})),
        ("POST", "/window") if take_failure(&state.window_failures) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": 13, "value": {"message": "webview not ready"}}).to_string(),
        ),
        ("POST", "/window") => match body.get("name").and_then(Value::as_str) {
            Some("NATIVE_APP") | Some("WEBVIEW_0") => ok_value(Value::Null),
            _ => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": 23, "value": {"message": "no such window"}}).to_string(),
            ),
        },
        _ => json_response(StatusCode::OK, OK_NULL.to_string()),
    }
}
