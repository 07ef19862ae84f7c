//! Process-wide state shared by every driver: per-package build locks and
//! the pool of forwarded system ports.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Default interval between cleanup runs (1 hour).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default idle age before a build lock is dropped (2 hours).
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(7200);

/// Package name to (lock, last access).
type LockStorage = DashMap<String, (Arc<Mutex<()>>, Instant)>;

/// Per-package locks around the modified server build.
///
/// Builds for different packages run concurrently; builds for the same
/// package wait for each other so one session never installs a half-written
/// apk another session is producing.
#[derive(Debug, Clone, Default)]
pub struct BuildLocks {
    locks: Arc<LockStorage>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for `package`, refreshing its access time.
    pub fn get(&self, package: &str) -> Arc<Mutex<()>> {
        let now = Instant::now();
        self.locks
            .entry(package.to_string())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Mutex::new(())), now))
            .0
            .clone()
    }

    /// Wait for exclusive use of `package`'s build output.
    pub async fn acquire(&self, package: &str) -> OwnedMutexGuard<()> {
        self.get(package).lock_owned().await
    }

    /// Drop locks idle for longer than `max_age` that nobody holds or waits on.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| {
                let (lock, last_access) = entry.value();
                Arc::strong_count(lock) == 1 && now.duration_since(*last_access) > max_age
            })
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for package in stale {
            self.locks.remove(&package);
        }
        count
    }

    /// Clean up stale locks in the background with the default intervals.
    pub fn spawn_cleanup_task(self) {
        self.spawn_cleanup_task_with(DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_IDLE_AGE);
    }

    /// Runs until the runtime shuts down.
    pub fn spawn_cleanup_task_with(self, interval: Duration, max_age: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_stale(max_age);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.len(),
                        locks = "build",
                        "Cleaned up stale locks"
                    );
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Local ports currently forwarded to a session's server.
///
/// A port stays claimed from the moment a session picks it until that
/// session is deleted, so two sessions starting together never share one.
#[derive(Debug, Clone, Default)]
pub struct PortPool {
    ports: Arc<DashSet<u16>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port`. False when another session already holds it.
    pub fn claim(&self, port: u16) -> bool {
        self.ports.insert(port)
    }

    /// Claim the first port in `range` that no session holds and nothing
    /// on this host is listening on.
    pub async fn reserve(&self, range: RangeInclusive<u16>) -> Option<u16> {
        for port in range {
            if !self.claim(port) {
                continue;
            }
            if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                return Some(port);
            }
            self.release(port);
        }
        None
    }

    pub fn release(&self, port: u16) {
        if self.ports.remove(&port).is_some() {
            debug!("Released system port {}", port);
        }
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
