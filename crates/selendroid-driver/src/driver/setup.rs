//! Shared Selendroid server artifacts.
//!
//! A separate install step extracts `selendroid-server.apk` and its
//! `AndroidManifest.xml` template into the server directory. Sessions only
//! check that they are there.

use std::io;
use std::path::{Path, PathBuf};

pub const SERVER_APK_NAME: &str = "selendroid-server.apk";
pub const MANIFEST_NAME: &str = "AndroidManifest.xml";

/// Locations of the shared base server apk and manifest template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArtifacts {
    pub dir: PathBuf,
    pub apk: PathBuf,
    pub manifest: PathBuf,
}

impl ServerArtifacts {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            apk: dir.join(SERVER_APK_NAME),
            manifest: dir.join(MANIFEST_NAME),
            dir,
        }
    }
}

async fn file_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True iff both the base apk and the manifest template exist.
///
/// A missing file is `Ok(false)`; any other filesystem error is returned.
pub async fn server_exists(artifacts: &ServerArtifacts) -> io::Result<bool> {
    Ok(file_exists(&artifacts.apk).await? && file_exists(&artifacts.manifest).await?)
}
