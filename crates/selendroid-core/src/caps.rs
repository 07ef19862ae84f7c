//! Desired capabilities and their constraints.
//!
//! Capabilities arrive as a loose JSON map. [`validate`] checks them against
//! [`CONSTRAINTS`] before anything touches a device, and [`Capabilities`]
//! is the typed view the driver works with afterwards. The raw map is kept
//! alongside so unknown keys are echoed back to the client unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// Expected JSON type of a capability value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Number,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Number => value.is_number(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ValueKind::String => "a string",
            ValueKind::Bool => "a boolean",
            ValueKind::Number => "a number",
        }
    }
}

/// One entry of the capability constraint table.
#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    pub name: &'static str,
    pub presence: bool,
    pub kind: ValueKind,
}

const fn required(name: &'static str, kind: ValueKind) -> Constraint {
    Constraint {
        name,
        presence: true,
        kind,
    }
}

const fn optional(name: &'static str, kind: ValueKind) -> Constraint {
    Constraint {
        name,
        presence: false,
        kind,
    }
}

/// Constraints consulted once at session creation.
pub const CONSTRAINTS: &[Constraint] = &[
    required("app", ValueKind::String),
    required("platformName", ValueKind::String),
    required("deviceName", ValueKind::String),
    optional("automationName", ValueKind::String),
    optional("browserName", ValueKind::String),
    optional("launchTimeout", ValueKind::Number),
    optional("newCommandTimeout", ValueKind::Number),
    optional("platformVersion", ValueKind::String),
    optional("appPackage", ValueKind::String),
    optional("appActivity", ValueKind::String),
    optional("appWaitPackage", ValueKind::String),
    optional("appWaitActivity", ValueKind::String),
    optional("udid", ValueKind::String),
    optional("avd", ValueKind::String),
    optional("avdArgs", ValueKind::String),
    optional("avdLaunchTimeout", ValueKind::Number),
    optional("avdReadyTimeout", ValueKind::Number),
    optional("language", ValueKind::String),
    optional("locale", ValueKind::String),
    optional("unicodeKeyboard", ValueKind::Bool),
    optional("resetKeyboard", ValueKind::Bool),
    optional("autoWebview", ValueKind::Bool),
    optional("autoWebviewTimeout", ValueKind::Number),
    optional("skipUninstall", ValueKind::Bool),
    optional("noSign", ValueKind::Bool),
    optional("fastReset", ValueKind::Bool),
    optional("systemPort", ValueKind::Number),
    optional("selendroidPort", ValueKind::Number),
    optional("adbPort", ValueKind::Number),
    optional("reboot", ValueKind::Bool),
    optional("intentAction", ValueKind::String),
    optional("intentCategory", ValueKind::String),
    optional("intentFlags", ValueKind::String),
    optional("optionalIntentArguments", ValueKind::String),
    optional("dontStopAppOnReset", ValueKind::Bool),
];

/// Check a raw capability map against [`CONSTRAINTS`] and the cross-field
/// rules, returning the first violation.
pub fn validate(caps: &Map<String, Value>) -> Result<(), ApiError> {
    for constraint in CONSTRAINTS {
        match caps.get(constraint.name) {
            None | Some(Value::Null) => {
                if constraint.presence {
                    return Err(ApiError::missing_capability(constraint.name));
                }
            }
            Some(value) => {
                if !constraint.kind.matches(value) {
                    return Err(ApiError::invalid_capability(
                        constraint.name,
                        constraint.kind.describe(),
                    ));
                }
                if constraint.presence
                    && constraint.kind == ValueKind::String
                    && value.as_str().is_some_and(|s| s.trim().is_empty())
                {
                    return Err(ApiError::missing_capability(constraint.name));
                }
            }
        }
    }

    let typed = Capabilities::from_map(caps)?;
    if typed.reboot.unwrap_or(false) {
        typed.resolve_avd_name()?;
    }
    Ok(())
}

/// Typed view over the capabilities the driver understands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub app: Option<String>,
    pub platform_name: Option<String>,
    pub platform_version: Option<String>,
    pub device_name: Option<String>,
    pub automation_name: Option<String>,
    pub app_package: Option<String>,
    pub app_activity: Option<String>,
    pub app_wait_package: Option<String>,
    pub app_wait_activity: Option<String>,
    pub udid: Option<String>,
    pub avd: Option<String>,
    pub avd_args: Option<String>,
    /// Milliseconds to wait for the emulator to appear in `adb devices`.
    pub avd_launch_timeout: Option<u64>,
    /// Milliseconds to wait for the emulator to finish booting.
    pub avd_ready_timeout: Option<u64>,
    pub language: Option<String>,
    pub locale: Option<String>,
    pub unicode_keyboard: Option<bool>,
    pub reset_keyboard: Option<bool>,
    pub auto_webview: Option<bool>,
    pub auto_webview_timeout: Option<u64>,
    pub skip_uninstall: Option<bool>,
    pub no_sign: Option<bool>,
    pub fast_reset: Option<bool>,
    pub system_port: Option<u16>,
    pub selendroid_port: Option<u16>,
    pub adb_port: Option<u16>,
    pub reboot: Option<bool>,
    pub intent_action: Option<String>,
    pub intent_category: Option<String>,
    pub intent_flags: Option<String>,
    pub optional_intent_arguments: Option<String>,
    pub dont_stop_app_on_reset: Option<bool>,
}

impl Capabilities {
    /// Parse the typed view out of a raw capability map.
    pub fn from_map(caps: &Map<String, Value>) -> Result<Self, ApiError> {
        serde_json::from_value(Value::Object(caps.clone()))
            .map_err(|e| ApiError::validation(format!("Invalid capabilities: {}", e)))
    }

    /// The user-requested system port, `systemPort` winning over the legacy
    /// `selendroidPort`.
    pub fn requested_system_port(&self) -> Option<u16> {
        self.system_port.or(self.selendroid_port)
    }

    pub fn unicode_keyboard(&self) -> bool {
        self.unicode_keyboard.unwrap_or(false)
    }

    /// Name of the AVD to boot.
    ///
    /// Uses `avd` when given (a leading `@` is dropped), otherwise derives
    /// `<deviceName>__<platformVersion>` with unsafe characters replaced.
    pub fn resolve_avd_name(&self) -> Result<String, ApiError> {
        if let Some(avd) = self.avd.as_deref().filter(|a| !a.is_empty()) {
            return Ok(avd.trim_start_matches('@').to_string());
        }

        let missing: Vec<&str> = [
            ("deviceName", self.device_name.as_deref()),
            ("platformVersion", self.platform_version.as_deref()),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_none_or(str::is_empty))
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(ApiError::validation(format!(
                "The 'reboot' capability needs an AVD: send 'avd', or both 'deviceName' and 'platformVersion' (missing: {})",
                missing.join(", ")
            )));
        }

        let device_name = self.device_name.as_deref().unwrap_or_default();
        let platform_version = self.platform_version.as_deref().unwrap_or_default();
        let safe_name: String = device_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        Ok(format!("{}__{}", safe_name, platform_version))
    }
}
