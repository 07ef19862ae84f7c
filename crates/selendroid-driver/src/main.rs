//! selendroid-driver CLI and HTTP host entry point.

mod args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use selendroid_driver::daemon::{paths, DriverFactory, HostConfig, HostServer};
use selendroid_driver::driver::adb::{AdbBridge, DeviceBridge, ToolPaths};
use selendroid_driver::driver::helpers::java_version;
use selendroid_driver::driver::setup::{server_exists, ServerArtifacts};
use selendroid_driver::driver::{DriverOptions, SelendroidDriver, SessionLifecycle};

use crate::args::{CheckArgs, Cli, Commands, ServeArgs};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Serve(args) => run_host(args).await,
            Commands::Check(args) => run_check(args).await,
        }
    });

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Run the HTTP host until SIGINT or SIGTERM, then tear down open sessions.
async fn run_host(args: ServeArgs) -> Result<()> {
    let tmp_dir = args.tmp_dir.unwrap_or_else(paths::get_tmp_dir);
    let server_dir = args.server_dir.unwrap_or_else(paths::get_server_dir);
    paths::ensure_tmp_dir(&tmp_dir)
        .with_context(|| format!("Failed to create scratch directory {:?}", tmp_dir))?;
    info!("Server artifacts: {:?}, scratch: {:?}", server_dir, tmp_dir);

    let opts = DriverOptions::new(tmp_dir, server_dir);
    opts.build_locks.clone().spawn_cleanup_task();
    let bridge: Arc<dyn DeviceBridge> =
        Arc::new(AdbBridge::new(ToolPaths::from_env()).with_adb_port(args.adb_port));
    let factory: DriverFactory = Arc::new(move || {
        Box::new(SelendroidDriver::new(opts.clone(), bridge.clone())) as Box<dyn SessionLifecycle>
    });

    let config = HostConfig {
        host: args.host,
        port: args.port,
        base_path: args.base_path,
    };
    let server = HostServer::bind(&config, factory).await?;
    server.run(shutdown_signal()).await
}

/// Report whether a session could start on this machine.
async fn run_check(args: CheckArgs) -> Result<()> {
    let server_dir: PathBuf = args.server_dir.unwrap_or_else(paths::get_server_dir);
    let artifacts = ServerArtifacts::in_dir(&server_dir);
    let bridge = AdbBridge::new(ToolPaths::from_env()).with_adb_port(args.adb_port);
    let mut ok = true;

    match server_exists(&artifacts).await {
        Ok(true) => println!("server artifacts  ok ({})", server_dir.display()),
        Ok(false) => {
            ok = false;
            println!(
                "server artifacts  missing: expected {} and {}",
                artifacts.apk.display(),
                artifacts.manifest.display()
            );
        }
        Err(e) => {
            ok = false;
            println!("server artifacts  unreadable: {}", e);
        }
    }

    match java_version(&bridge).await {
        Ok(version) => println!("java              ok ({})", version),
        Err(e) => {
            ok = false;
            println!("java              {}", e);
        }
    }

    match bridge.list_devices().await {
        Ok(devices) if devices.is_empty() => println!("adb               ok (no devices connected)"),
        Ok(devices) => {
            let udids: Vec<&str> = devices.iter().map(|d| d.udid.as_str()).collect();
            println!("adb               ok ({})", udids.join(", "));
        }
        Err(e) => {
            ok = false;
            println!("adb               {}", e);
        }
    }

    if !ok {
        anyhow::bail!("environment check failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }
}

/// Wait for SIGTERM signal (Unix only).
///
/// If registration fails the host only responds to SIGINT.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, host will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
