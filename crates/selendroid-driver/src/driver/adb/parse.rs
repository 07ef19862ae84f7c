//! Parsers for adb, aapt and java output.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{DeviceEntry, LaunchInfo, LogEntry};

static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"package: name='([^']+)'").expect("PACKAGE_RE should compile")
});
static ACTIVITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"launchable-activity: name='([^']+)'").expect("ACTIVITY_RE should compile")
});
static FOCUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:mCurrentFocus|mFocusedApp)=.*?\s([^\s/{}]+)/([^\s/{}]+)")
        .expect("FOCUS_RE should compile")
});
static STRING_RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"resource 0x[0-9a-fA-F]+ [^:]+:string/([^:\s]+):")
        .expect("STRING_RESOURCE_RE should compile")
});
static STRING_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*\((?:string8|string16)\) "(.*)"\s*$"#).expect("STRING_VALUE_RE should compile")
});
static CONFIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*config (\S+?):?\s*$").expect("CONFIG_RE should compile")
});

/// Parse `adb devices` output.
pub fn parse_devices(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let udid = parts.next()?;
            let state = parts.next()?;
            Some(DeviceEntry {
                udid: udid.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Console port of an emulator udid such as `emulator-5554`.
pub fn emulator_port(udid: &str) -> Option<u16> {
    udid.strip_prefix("emulator-")?.parse().ok()
}

/// Package and launchable activity from `aapt dump badging`.
pub fn parse_badging(output: &str) -> LaunchInfo {
    LaunchInfo {
        package: PACKAGE_RE
            .captures(output)
            .map(|c| c[1].to_string()),
        activity: ACTIVITY_RE
            .captures(output)
            .map(|c| c[1].to_string()),
    }
}

/// Whether `aapt dump permissions` lists INTERNET.
pub fn has_internet_permission(output: &str) -> bool {
    output.lines().any(|line| {
        line.trim_start().starts_with("uses-permission")
            && line.contains("android.permission.INTERNET")
    })
}

/// Focused package and activity from `dumpsys window windows`.
pub fn parse_focus(output: &str) -> Option<(String, String)> {
    output.lines().find_map(|line| {
        FOCUS_RE
            .captures(line)
            .map(|c| (c[1].to_string(), c[2].to_string()))
    })
}

/// Whether the focused activity satisfies the wait target.
///
/// `expected` may be a comma-separated list, and entries starting with `.`
/// are relative to `package`. A `*` matches any activity.
pub fn activity_matches(
    package: &str,
    expected: &str,
    found_package: &str,
    found_activity: &str,
) -> bool {
    if package != found_package {
        return false;
    }
    let found_full = if found_activity.starts_with('.') {
        format!("{}{}", found_package, found_activity)
    } else {
        found_activity.to_string()
    };
    expected.split(',').map(str::trim).any(|want| {
        if want == "*" {
            return true;
        }
        let want_full = if want.starts_with('.') {
            format!("{}{}", package, want)
        } else {
            want.to_string()
        };
        want_full == found_full
    })
}

/// Context names for devtools sockets in `/proc/net/unix`.
///
/// `@chrome_devtools_remote` is the Chrome browser, `@webview_devtools_remote_<pid>`
/// is an app webview.
pub fn parse_webview_sockets(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut contexts = Vec::new();
    for line in output.lines() {
        let Some(socket) = line.split_whitespace().last() else {
            continue;
        };
        let context = if socket == "@chrome_devtools_remote" {
            "CHROMIUM".to_string()
        } else if let Some(pid) = socket.strip_prefix("@webview_devtools_remote_") {
            format!("WEBVIEW_{}", pid)
        } else {
            continue;
        };
        if seen.insert(context.clone()) {
            contexts.push(context);
        }
    }
    contexts
}

/// Parse a `settings get` boolean.
pub fn parse_setting_flag(output: &str) -> bool {
    output.trim() == "1"
}

/// Non-empty trimmed lines, e.g. from `ime list -s`.
pub fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// String table from `aapt dump --values resources`.
///
/// Picks entries from the `language` config when given, otherwise from the
/// default config.
pub fn parse_string_resources(output: &str, language: Option<&str>) -> Map<String, Value> {
    let wanted = language.unwrap_or("(default)");
    let mut strings = Map::new();
    let mut in_wanted_config = false;
    let mut pending: Option<String> = None;

    for line in output.lines() {
        if let Some(c) = CONFIG_RE.captures(line) {
            in_wanted_config = &c[1] == wanted;
            pending = None;
            continue;
        }
        if !in_wanted_config {
            continue;
        }
        if let Some(c) = STRING_RESOURCE_RE.captures(line) {
            pending = Some(c[1].to_string());
            continue;
        }
        if let (Some(name), Some(c)) = (pending.as_ref(), STRING_VALUE_RE.captures(line)) {
            strings.insert(name.clone(), Value::String(c[1].to_string()));
            pending = None;
        }
    }
    strings
}

/// A `logcat -v threadtime` line.
pub fn parse_logcat_line(line: &str, timestamp: i64) -> Option<LogEntry> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with("---------") {
        return None;
    }
    let mut parts = line.split_whitespace();
    let _date = parts.next()?;
    let _time = parts.next()?;
    let _pid = parts.next()?;
    let _tid = parts.next()?;
    let level = parts.next()?;
    let level = match level {
        "V" => "ALL",
        "D" => "DEBUG",
        "I" => "INFO",
        "W" => "WARNING",
        "E" | "F" => "SEVERE",
        _ => "INFO",
    };
    Some(LogEntry {
        timestamp,
        level: level.to_string(),
        message: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_skips_header() {
        let out = "List of devices attached\nemulator-5554\tdevice\n0123abcd\toffline\n\n";
        let devices = parse_devices(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].udid, "emulator-5554");
        assert_eq!(devices[0].state, "device");
        assert_eq!(devices[1].state, "offline");
    }

    #[test]
    fn test_parse_devices_ignores_daemon_banner() {
        let out = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\nabc\tdevice\n";
        assert_eq!(parse_devices(out).len(), 1);
    }

    #[test]
    fn test_emulator_port() {
        assert_eq!(emulator_port("emulator-5554"), Some(5554));
        assert_eq!(emulator_port("0123abcd"), None);
        assert_eq!(emulator_port("emulator-x"), None);
    }

    #[test]
    fn test_parse_badging() {
        let out = "package: name='io.selendroid.testapp' versionCode='1' versionName='0.15.0'\n\
                   sdkVersion:'10'\n\
                   launchable-activity: name='io.selendroid.testapp.HomeScreenActivity'  label='' icon=''\n";
        let info = parse_badging(out);
        assert_eq!(info.package.as_deref(), Some("io.selendroid.testapp"));
        assert_eq!(
            info.activity.as_deref(),
            Some("io.selendroid.testapp.HomeScreenActivity")
        );
    }

    #[test]
    fn test_parse_badging_without_activity() {
        let info = parse_badging("package: name='com.example.service'\n");
        assert_eq!(info.package.as_deref(), Some("com.example.service"));
        assert_eq!(info.activity, None);
    }

    #[test]
    fn test_internet_permission() {
        let with = "package: com.example\nuses-permission: name='android.permission.INTERNET'\n";
        let without = "package: com.example\nuses-permission: name='android.permission.CAMERA'\n";
        assert!(has_internet_permission(with));
        assert!(!has_internet_permission(without));
        assert!(has_internet_permission("uses-permission: android.permission.INTERNET"));
    }

    #[test]
    fn test_parse_focus_current_focus() {
        let out = "  mCurrentFocus=Window{4d6fce3 u0 com.example/com.example.MainActivity}\n";
        assert_eq!(
            parse_focus(out),
            Some(("com.example".to_string(), "com.example.MainActivity".to_string()))
        );
    }

    #[test]
    fn test_parse_focus_focused_app() {
        let out = "  mFocusedApp=AppWindowToken{1 token=Token{2 ActivityRecord{3 u0 com.example/.Main t12}}}\n";
        assert_eq!(
            parse_focus(out),
            Some(("com.example".to_string(), ".Main".to_string()))
        );
    }

    #[test]
    fn test_parse_focus_none() {
        assert_eq!(parse_focus("  mCurrentFocus=null\n"), None);
    }

    #[test]
    fn test_activity_matches_relative_and_lists() {
        assert!(activity_matches("com.ex", ".Main", "com.ex", "com.ex.Main"));
        assert!(activity_matches("com.ex", "com.ex.Main", "com.ex", ".Main"));
        assert!(activity_matches("com.ex", ".Splash, .Main", "com.ex", ".Main"));
        assert!(activity_matches("com.ex", "*", "com.ex", ".Anything"));
        assert!(!activity_matches("com.ex", ".Main", "com.other", ".Main"));
        assert!(!activity_matches("com.ex", ".Main", "com.ex", ".Other"));
    }

    #[test]
    fn test_parse_webview_sockets() {
        let out = "\
Num       RefCount Protocol Flags    Type St Inode Path
00000000: 00000002 00000000 00010000 0001 01 12345 @chrome_devtools_remote
00000000: 00000002 00000000 00010000 0001 01 12346 @webview_devtools_remote_4242
00000000: 00000002 00000000 00010000 0001 01 12347 @webview_devtools_remote_4242
00000000: 00000002 00000000 00010000 0001 01 12348 /dev/socket/zygote
";
        assert_eq!(parse_webview_sockets(out), vec!["CHROMIUM", "WEBVIEW_4242"]);
    }

    #[test]
    fn test_parse_setting_flag() {
        assert!(parse_setting_flag("1\n"));
        assert!(!parse_setting_flag("0"));
        assert!(!parse_setting_flag("null"));
    }

    #[test]
    fn test_parse_string_resources_default_and_language() {
        let out = r#"Package Groups (1)
Package Group 0 id=0x7f packageCount=1 name=com.example
  Package 0 id=0x7f name=com.example
    type 3 configCount=2 entryCount=2
      config (default):
        resource 0x7f050000 com.example:string/app_name: t=0x03 d=0x00000000 (s=0x0008 r=0x00)
          (string8) "Example"
        resource 0x7f050001 com.example:string/greeting: t=0x03 d=0x00000001 (s=0x0008 r=0x00)
          (string16) "Hello"
      config fr:
        resource 0x7f050001 com.example:string/greeting: t=0x03 d=0x00000002 (s=0x0008 r=0x00)
          (string16) "Bonjour"
"#;
        let default = parse_string_resources(out, None);
        assert_eq!(default.len(), 2);
        assert_eq!(default["app_name"], "Example");
        assert_eq!(default["greeting"], "Hello");

        let fr = parse_string_resources(out, Some("fr"));
        assert_eq!(fr.len(), 1);
        assert_eq!(fr["greeting"], "Bonjour");
    }

    #[test]
    fn test_parse_logcat_line() {
        let entry =
            parse_logcat_line("01-02 03:04:05.678  1234  5678 W ActivityManager: slow", 7).unwrap();
        assert_eq!(entry.level, "WARNING");
        assert_eq!(entry.timestamp, 7);
        assert!(entry.message.contains("slow"));

        assert!(parse_logcat_line("--------- beginning of main", 0).is_none());
        assert!(parse_logcat_line("", 0).is_none());
    }
}
