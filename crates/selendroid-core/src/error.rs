//! Driver error types with remediation suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for driver and host responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SetupMissing,
    ValidationError,
    AppNotFound,
    PermissionError,
    DeviceNotFound,
    EnvironmentError,
    ServerStartupTimeout,
    ProxyTransportError,
    SessionNotFound,
    UnknownCommand,
    NoSuchContext,
    NotImplemented,
    CommandFailed,
    InternalError,
}

impl ErrorCode {
    /// HTTP status the host answers with for this code.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::SessionNotFound
            | ErrorCode::UnknownCommand
            | ErrorCode::NoSuchContext => 404,
            ErrorCode::NotImplemented => 501,
            _ => 500,
        }
    }

    /// W3C WebDriver error string for this code.
    pub fn w3c_error(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "invalid argument",
            ErrorCode::SessionNotFound => "invalid session id",
            ErrorCode::UnknownCommand => "unknown command",
            ErrorCode::NoSuchContext => "no such context",
            ErrorCode::NotImplemented => "unsupported operation",
            ErrorCode::SetupMissing
            | ErrorCode::AppNotFound
            | ErrorCode::PermissionError
            | ErrorCode::DeviceNotFound
            | ErrorCode::EnvironmentError
            | ErrorCode::ServerStartupTimeout => "session not created",
            ErrorCode::ProxyTransportError
            | ErrorCode::CommandFailed
            | ErrorCode::InternalError => "unknown error",
        }
    }

    /// Legacy JSON-wire numeric status.
    pub fn jsonwp_status(self) -> i64 {
        match self {
            ErrorCode::SessionNotFound => 6,
            ErrorCode::UnknownCommand => 9,
            ErrorCode::NoSuchContext => 35,
            ErrorCode::SetupMissing
            | ErrorCode::AppNotFound
            | ErrorCode::PermissionError
            | ErrorCode::DeviceNotFound
            | ErrorCode::EnvironmentError
            | ErrorCode::ServerStartupTimeout => 33,
            _ => 13,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::SetupMissing => "SETUP_MISSING",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AppNotFound => "APP_NOT_FOUND",
            ErrorCode::PermissionError => "PERMISSION_ERROR",
            ErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorCode::EnvironmentError => "ENVIRONMENT_ERROR",
            ErrorCode::ServerStartupTimeout => "SERVER_STARTUP_TIMEOUT",
            ErrorCode::ProxyTransportError => "PROXY_TRANSPORT_ERROR",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::NoSuchContext => "NO_SUCH_CONTEXT",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// A driver error with remediation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// The shared Selendroid server apk or manifest template is missing.
    pub fn setup_missing(server_dir: &str) -> Self {
        Self {
            code: ErrorCode::SetupMissing,
            message: format!(
                "Can't start a selendroid session because the server apk doesn't exist in '{}'",
                server_dir
            ),
            suggestion: Some(
                "Run the selendroid install step to download and extract the server artifacts"
                    .into(),
            ),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            message: message.into(),
            suggestion: Some("Check the desired capabilities and try again".into()),
        }
    }

    /// A required capability was not sent.
    pub fn missing_capability(name: &str) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            message: format!("The '{}' capability is required but was not found", name),
            suggestion: Some(format!("Add '{}' to the desired capabilities", name)),
        }
    }

    /// A capability was sent with the wrong type.
    pub fn invalid_capability(name: &str, expected: &str) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            message: format!("The '{}' capability must be {}", name, expected),
            suggestion: Some(format!("Send '{}' as {}", name, expected)),
        }
    }

    pub fn app_not_found(path: &str) -> Self {
        Self {
            code: ErrorCode::AppNotFound,
            message: format!("Could not find app apk at '{}': the file does not exist", path),
            suggestion: Some(
                "Make sure the 'app' capability points at a readable .apk on this machine".into(),
            ),
        }
    }

    pub fn missing_internet_permission(app: &str) -> Self {
        Self {
            code: ErrorCode::PermissionError,
            message: format!(
                "The apk '{}' does not have INTERNET permissions. Selendroid needs the internet permission to proceed",
                app
            ),
            suggestion: Some(
                "Add <uses-permission android:name=\"android.permission.INTERNET\"/> to your AndroidManifest.xml"
                    .into(),
            ),
        }
    }

    pub fn device_not_found(udid: &str) -> Self {
        Self {
            code: ErrorCode::DeviceNotFound,
            message: format!("Device {} was not in the list of connected devices", udid),
            suggestion: Some("Run 'adb devices' to see which devices are connected".into()),
        }
    }

    pub fn no_devices() -> Self {
        Self {
            code: ErrorCode::DeviceNotFound,
            message: "Could not find a connected Android device".to_string(),
            suggestion: Some(
                "Connect a device or start an emulator, or pass the 'avd' capability".into(),
            ),
        }
    }

    pub fn java_missing(detail: &str) -> Self {
        Self {
            code: ErrorCode::EnvironmentError,
            message: format!("Could not get the Java version. Is Java installed? ({})", detail),
            suggestion: Some("Install a JDK and make sure 'java' is on your PATH".into()),
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::EnvironmentError,
            message: message.into(),
            suggestion: Some("Check that the Android SDK tools are installed and on your PATH".into()),
        }
    }

    pub fn server_startup_timeout(attempts: u32, last_error: &str) -> Self {
        Self {
            code: ErrorCode::ServerStartupTimeout,
            message: format!(
                "Selendroid server did not come online after {} status checks: {}",
                attempts, last_error
            ),
            suggestion: Some(
                "Check the device logcat for instrumentation crashes and that the system port is forwarded"
                    .into(),
            ),
        }
    }

    pub fn proxy_transport(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ProxyTransportError,
            message: message.into(),
            suggestion: Some(
                "The Selendroid server may have crashed. Restart the session if it persists".into(),
            ),
        }
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session '{}' not found", session_id),
            suggestion: Some("Create a new session with POST /session".into()),
        }
    }

    /// Create an error when the session limit is reached.
    pub fn session_limit_reached(max: usize) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: format!("Maximum session limit ({}) reached", max),
            suggestion: Some("Delete an existing session before creating a new one".into()),
        }
    }

    pub fn unknown_command(method: &str, path: &str) -> Self {
        Self {
            code: ErrorCode::UnknownCommand,
            message: format!("The command '{} {}' is not supported", method, path),
            suggestion: Some("Check the endpoint against the WebDriver protocol".into()),
        }
    }

    pub fn no_such_context(name: &str) -> Self {
        Self {
            code: ErrorCode::NoSuchContext,
            message: format!("Context '{}' does not exist", name),
            suggestion: Some("Call GET /contexts to list the available contexts".into()),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotImplemented,
            message: message.into(),
            suggestion: Some("This operation is not available through Selendroid".into()),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: Some("Check the device state and the driver logs".into()),
        }
    }

    /// Create a command failed error with a custom suggestion.
    pub fn command_failed_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_has_suggestion(err: &ApiError, context: &str) {
        assert!(
            err.suggestion.is_some(),
            "{} should have a suggestion, but got None",
            context
        );
    }

    #[test]
    fn test_setup_missing_mentions_install() {
        let err = ApiError::setup_missing("/opt/selendroid");
        assert_has_suggestion(&err, "setup_missing");
        assert_eq!(err.code, ErrorCode::SetupMissing);
        assert!(err.message.contains("/opt/selendroid"));
        assert!(err.suggestion.as_ref().unwrap().contains("install"));
    }

    #[test]
    fn test_missing_capability_says_not_found() {
        let err = ApiError::missing_capability("app");
        assert_has_suggestion(&err, "missing_capability");
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("'app'"));
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_app_not_found_says_does_not_exist() {
        let err = ApiError::app_not_found("/tmp/nope.apk");
        assert_has_suggestion(&err, "app_not_found");
        assert!(err.message.contains("does not exist"));
        assert!(err.message.contains("/tmp/nope.apk"));
    }

    #[test]
    fn test_internet_permission_has_remediation() {
        let err = ApiError::missing_internet_permission("app.apk");
        assert_eq!(err.code, ErrorCode::PermissionError);
        assert!(err
            .suggestion
            .as_ref()
            .unwrap()
            .contains("android.permission.INTERNET"));
    }

    #[test]
    fn test_device_not_found_names_udid() {
        let err = ApiError::device_not_found("emulator-5556");
        assert_has_suggestion(&err, "device_not_found");
        assert!(err.message.contains("emulator-5556"));
    }

    #[test]
    fn test_all_constructors_have_suggestions() {
        let errors = [
            ApiError::validation("bad"),
            ApiError::invalid_capability("systemPort", "a number"),
            ApiError::no_devices(),
            ApiError::java_missing("not on PATH"),
            ApiError::environment("aapt missing"),
            ApiError::server_startup_timeout(20, "connection refused"),
            ApiError::proxy_transport("reset"),
            ApiError::session_not_found("abc"),
            ApiError::session_limit_reached(100),
            ApiError::unknown_command("GET", "/foo"),
            ApiError::no_such_context("WEBVIEW_9"),
            ApiError::not_implemented("metastate"),
            ApiError::command_failed("boom"),
            ApiError::command_failed_with_suggestion("boom", "try again"),
            ApiError::internal("oops"),
        ];
        for err in &errors {
            assert_has_suggestion(err, &err.code.to_string());
        }
    }

    #[test]
    fn test_startup_errors_map_to_session_not_created() {
        for code in [
            ErrorCode::SetupMissing,
            ErrorCode::AppNotFound,
            ErrorCode::PermissionError,
            ErrorCode::DeviceNotFound,
            ErrorCode::EnvironmentError,
            ErrorCode::ServerStartupTimeout,
        ] {
            assert_eq!(code.w3c_error(), "session not created");
            assert_eq!(code.http_status(), 500);
            assert_eq!(code.jsonwp_status(), 33);
        }
    }

    #[test]
    fn test_lookup_errors_are_404() {
        assert_eq!(ErrorCode::SessionNotFound.http_status(), 404);
        assert_eq!(ErrorCode::UnknownCommand.http_status(), 404);
        assert_eq!(ErrorCode::ValidationError.http_status(), 400);
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let err = ApiError::session_not_found("abc");
        let display = format!("{}", err);
        assert!(display.contains("[SESSION_NOT_FOUND]"));
        assert!(display.contains("abc"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_json_serialization() {
        let err = ApiError::proxy_transport("connection reset");
        let json = serde_json::to_string(&err).unwrap();

        assert!(json.contains("\"code\""));
        assert!(json.contains("\"message\""));
        assert!(json.contains("\"suggestion\""));
        assert!(json.contains("PROXY_TRANSPORT_ERROR"));
    }

    #[test]
    fn test_json_deserialization() {
        let json = r#"{"code":"APP_NOT_FOUND","message":"gone","suggestion":"hint"}"#;
        let err: ApiError = serde_json::from_str(json).unwrap();
        assert!(matches!(err.code, ErrorCode::AppNotFound));
        assert_eq!(err.message, "gone");
        assert_eq!(err.suggestion, Some("hint".to_string()));
    }
}
