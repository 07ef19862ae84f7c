//! Server artifact and scratch directory resolution.
//!
//! Priority for the server directory (holding `selendroid-server.apk` and
//! `AndroidManifest.xml`):
//! 1. `SELENDROID_SERVER_DIR` (explicit override)
//! 2. `XDG_DATA_HOME/selendroid`
//! 3. `~/.selendroid`
//! 4. `<temp>/selendroid` (last resort)
//!
//! Priority for the scratch directory that modified servers are built in:
//! 1. `SELENDROID_TMP_DIR`
//! 2. `<temp>/selendroid-driver`

use std::env;
use std::path::PathBuf;

/// Read an env var, treating an empty value as unset.
fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get the directory the shared Selendroid server artifacts live in.
pub fn get_server_dir() -> PathBuf {
    if let Some(dir) = non_empty_var("SELENDROID_SERVER_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(data_home) = non_empty_var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join("selendroid");
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".selendroid");
    }

    env::temp_dir().join("selendroid")
}

/// Get the scratch directory modified servers are built under.
pub fn get_tmp_dir() -> PathBuf {
    non_empty_var("SELENDROID_TMP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("selendroid-driver"))
}

/// Ensure the scratch directory exists with owner-only permissions on Unix.
pub fn ensure_tmp_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}
