//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use selendroid_driver::daemon::server::{DEFAULT_BASE_PATH, DEFAULT_HOST, DEFAULT_PORT};
use selendroid_driver::driver::adb::DEFAULT_ADB_PORT;

const SERVER_DIR_HELP: &str = "Directory holding selendroid-server.apk and AndroidManifest.xml \
[default: $SELENDROID_SERVER_DIR, $XDG_DATA_HOME/selendroid or ~/.selendroid]";

/// WebDriver driver for Android apps, backed by Selendroid.
///
/// Accepts JSON wire protocol sessions over HTTP, prepares the device and
/// the instrumentation server, then forwards commands to it.
#[derive(Debug, Parser)]
#[command(name = "selendroid-driver", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the WebDriver HTTP host
    #[command(after_help = "\
Examples:
  selendroid-driver serve                          # localhost:4884/wd/hub
  selendroid-driver serve --host 0.0.0.0 -p 4723   # Listen on all interfaces
  selendroid-driver serve --base-path /            # Serve at the root
  selendroid-driver serve --adb-port 5038          # Non-default adb server

Environment:
  ANDROID_HOME, JAVA_HOME        Where adb, aapt, apksigner and java live
  SELENDROID_SERVER_DIR          Server artifacts directory
  SELENDROID_TMP_DIR             Where per-app servers are built
  RUST_LOG                       Log filter (default: info)")]
    Serve(ServeArgs),

    /// Check that the server artifacts, Java and adb are usable
    #[command(after_help = "\
Examples:
  selendroid-driver check
  selendroid-driver check --server-dir ./selendroid")]
    Check(CheckArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path prefix for every endpoint
    #[arg(long, default_value = DEFAULT_BASE_PATH)]
    pub base_path: String,

    /// Scratch directory for modified servers [default: $SELENDROID_TMP_DIR or <temp>/selendroid-driver]
    #[arg(long, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = SERVER_DIR_HELP)]
    pub server_dir: Option<PathBuf>,

    /// Port of the adb server
    #[arg(long, default_value_t = DEFAULT_ADB_PORT)]
    pub adb_port: u16,
}

#[derive(Debug, clap::Args)]
pub struct CheckArgs {
    #[arg(long, value_name = "DIR", help = SERVER_DIR_HELP)]
    pub server_dir: Option<PathBuf>,

    /// Port of the adb server
    #[arg(long, default_value_t = DEFAULT_ADB_PORT)]
    pub adb_port: u16,
}
