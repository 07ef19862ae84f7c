//! Startup helpers shared by session creation and reset.

use std::path::Path;
use std::time::Duration;

use selendroid_core::caps::Capabilities;
use selendroid_core::error::ApiError;
use tracing::{debug, info, warn};

use super::adb::{AvdLaunch, DeviceBridge, DeviceControl, DeviceHandle, DEFAULT_ADB_PORT};

/// IME that decodes the modified UTF-7 sent for unicode text.
pub const UNICODE_IME: &str = "io.appium.android.ime/.UnicodeIME";

/// Version string from `java -version` output, e.g. `1.8.0_40`.
pub fn parse_java_version(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("java version") || line.contains("openjdk version"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(|version| version.replace('"', ""))
}

/// Resolve the host Java version, failing if Java is unavailable.
pub async fn java_version(bridge: &dyn DeviceBridge) -> Result<String, ApiError> {
    debug!("Getting Java version");
    let output = bridge
        .java_version_output()
        .await
        .map_err(|e| ApiError::java_missing(&e.to_string()))?;
    let version = parse_java_version(&output)
        .ok_or_else(|| ApiError::java_missing("unrecognised 'java -version' output"))?;
    info!("Java version is: {}", version);
    Ok(version)
}

/// Boot the AVD unless it is already running. Returns true if it was launched.
pub async fn prepare_emulator(
    bridge: &dyn DeviceBridge,
    caps: &Capabilities,
    avd_name: &str,
) -> Result<bool, ApiError> {
    if bridge.get_running_avd(avd_name).await?.is_some() {
        debug!("Not launching AVD because it is already running.");
        return Ok(false);
    }
    let launch = AvdLaunch {
        name: avd_name.to_string(),
        args: caps.avd_args.clone(),
        language: caps.language.clone(),
        country: caps.locale.clone(),
        launch_timeout: caps.avd_launch_timeout.map(Duration::from_millis),
        ready_timeout: caps.avd_ready_timeout.map(Duration::from_millis),
    };
    bridge.launch_avd(&launch).await?;
    Ok(true)
}

/// Pick the device for this session.
///
/// An explicit udid must be among the connected devices; otherwise the first
/// connected device is used.
pub async fn get_active_device(
    bridge: &dyn DeviceBridge,
    udid: Option<&str>,
    adb_port: Option<u16>,
) -> Result<DeviceHandle, ApiError> {
    info!("Retrieving device list");
    let devices = bridge.list_devices().await?;

    let device_id = match udid {
        Some(udid) => {
            if !devices.iter().any(|d| d.udid == udid) {
                return Err(ApiError::device_not_found(udid));
            }
            udid.to_string()
        }
        None => devices
            .first()
            .map(|d| d.udid.clone())
            .ok_or_else(ApiError::no_devices)?,
    };

    info!("Found device: {}", device_id);
    Ok(DeviceHandle::new(device_id).with_adb_port(adb_port.unwrap_or(DEFAULT_ADB_PORT)))
}

pub async fn ensure_internet_permission(
    device: &dyn DeviceControl,
    app: &Path,
) -> Result<(), ApiError> {
    if device.has_internet_permission_from_manifest(app).await? {
        return Ok(());
    }
    Err(ApiError::missing_internet_permission(&app.display().to_string()))
}

/// Package, activity and their wait counterparts for the AUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub package: String,
    pub activity: String,
    pub wait_package: String,
    pub wait_activity: String,
}

/// Fill in package and activity from the apk manifest where capabilities
/// leave them out. Wait package/activity default to package/activity.
pub async fn resolve_launch_info(
    device: &dyn DeviceControl,
    app: &Path,
    caps: &Capabilities,
) -> Result<ResolvedLaunch, ApiError> {
    let mut package = caps.app_package.clone();
    let mut activity = caps.app_activity.clone();

    if package.is_none() || activity.is_none() {
        debug!("Parsing package and activity from app manifest");
        let info = device.package_and_launch_activity_from_manifest(app).await?;
        debug!(
            "Parsed package and activity are: {:?}/{:?}",
            info.package, info.activity
        );
        package = package.or(info.package);
        activity = activity.or(info.activity);
    }

    let package = package.ok_or_else(|| {
        ApiError::validation("Could not determine the app package; set the 'appPackage' capability")
    })?;
    let activity = activity.ok_or_else(|| {
        ApiError::validation(
            "Could not determine the launch activity; set the 'appActivity' capability",
        )
    })?;

    Ok(ResolvedLaunch {
        wait_package: caps.app_wait_package.clone().unwrap_or_else(|| package.clone()),
        wait_activity: caps
            .app_wait_activity
            .clone()
            .unwrap_or_else(|| activity.clone()),
        package,
        activity,
    })
}

/// Apply `language`/`locale`, rebooting when either changed.
/// Returns whether the device was rebooted.
pub async fn ensure_device_locale(
    device: &dyn DeviceControl,
    language: Option<&str>,
    country: Option<&str>,
) -> Result<bool, ApiError> {
    let language = language.filter(|l| !l.is_empty());
    let country = country.filter(|c| !c.is_empty());
    if language.is_none() && country.is_none() {
        return Ok(false);
    }

    let current_language = device.get_device_language().await?;
    let current_country = device.get_device_country().await?;
    let mut changed = false;

    if let Some(language) = language {
        if language != current_language {
            device.set_device_language(language).await?;
            changed = true;
        }
    }
    if let Some(country) = country {
        if country != current_country {
            device.set_device_country(country).await?;
            changed = true;
        }
    }

    if changed {
        info!("Device locale changed, rebooting");
        device.reboot().await?;
    }
    Ok(changed)
}

/// Switch to the unicode IME, returning the IME it replaced.
pub async fn init_unicode_keyboard(device: &dyn DeviceControl) -> Result<Option<String>, ApiError> {
    debug!("Enabling Unicode keyboard support");
    let default_ime = device.default_ime().await?;
    debug!("Unsetting previous IME {:?}", default_ime);
    device.enable_ime(UNICODE_IME).await?;
    device.set_ime(UNICODE_IME).await?;
    Ok(default_ime)
}

/// Install the AUT honouring `fastReset` and `skipUninstall`.
pub async fn install_app(
    device: &dyn DeviceControl,
    app: &Path,
    package: &str,
    caps: &Capabilities,
) -> Result<(), ApiError> {
    if caps.fast_reset.unwrap_or(false) && device.is_app_installed(package).await? {
        info!("App is already installed, clearing data for fast reset");
        device.clear_app_data(package).await?;
        return Ok(());
    }
    if !caps.skip_uninstall.unwrap_or(false) {
        device.uninstall_apk(package).await?;
    }
    info!("Installing {}", app.display());
    device.install(app).await?;
    Ok(())
}

/// Best-effort string table extraction; failures only log.
pub async fn extract_strings(
    device: &dyn DeviceControl,
    app: &Path,
    language: Option<&str>,
) -> serde_json::Map<String, serde_json::Value> {
    match device.extract_strings_from_apk(app, language).await {
        Ok(strings) => strings,
        Err(e) => {
            warn!("Could not extract strings from {}: {}", app.display(), e);
            serde_json::Map::new()
        }
    }
}
