//! Capacity governor
//!
//! Bounded admission control with a live-mutable limit. The semaphore
//! holds the *available* permits (`limit - active`); acquisition forgets a
//! permit and release adds one back, so replacing the semaphore during a
//! resize transfers capacity without ever revoking an active permit — a
//! resize only narrows the ceiling for future acquires.
//!
//! Limit changes arrive through a bounded channel from two side channels
//! (SIGUSR1/SIGUSR2 and the management endpoint), are validated against the
//! live `active` count, and are written through to the persistent limit
//! artifact on acceptance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::defaults::SIGNAL_LIMIT_DELTA;
use crate::error::{DbError, Result};

use super::persistence;

/// Admission controller for client connections
pub struct Governor {
    limit: AtomicUsize,
    active: AtomicUsize,
    /// Available permits; swapped wholesale on resize
    semaphore: RwLock<Arc<Semaphore>>,
    /// Open connections by peer address, for stats and shutdown accounting
    connections: Mutex<HashMap<SocketAddr, Instant>>,
    updates: mpsc::Sender<usize>,
    limit_path: PathBuf,
}

/// Snapshot of connection counts
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub usage_percentage: f64,
    pub available_slots: usize,
}

impl Governor {
    /// Build the governor, seeding the limit from the persisted artifact
    /// when present, and start the update-processing task.
    pub fn new(limit_path: PathBuf, default_limit: usize) -> Arc<Self> {
        let limit = match persistence::load_connection_limit(&limit_path) {
            Ok(Some(persisted)) => {
                if persisted != default_limit {
                    tracing::info!(
                        persisted,
                        default = default_limit,
                        "using persisted connection limit"
                    );
                }
                persisted
            }
            Ok(None) => default_limit,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted connection limit");
                default_limit
            }
        };

        let (updates, updates_rx) = mpsc::channel(10);

        let governor = Arc::new(Self {
            limit: AtomicUsize::new(limit),
            active: AtomicUsize::new(0),
            semaphore: RwLock::new(Arc::new(Semaphore::new(limit))),
            connections: Mutex::new(HashMap::new()),
            updates,
            limit_path,
        });

        spawn_update_processor(Arc::clone(&governor), updates_rx);
        governor
    }

    /// Non-blocking admission attempt; rejection is immediate
    pub fn try_acquire(&self, addr: SocketAddr) -> Result<()> {
        let semaphore = self.semaphore.read();
        let result = match semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.active.fetch_add(1, Ordering::SeqCst);
                self.connections.lock().insert(addr, Instant::now());
                Ok(())
            }
            Err(_) => Err(DbError::Capacity {
                limit: self.limit.load(Ordering::SeqCst),
            }),
        };
        result
    }

    /// Return a permit and deregister the connection
    pub fn release(&self, addr: SocketAddr) {
        let semaphore = self.semaphore.read();
        semaphore.add_permits(1);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.connections.lock().remove(&addr);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn current_limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        let active = self.active();
        let max = self.current_limit();
        ConnectionStats {
            active_connections: active,
            max_connections: max,
            usage_percentage: if max > 0 {
                active as f64 / max as f64 * 100.0
            } else {
                0.0
            },
            available_slots: max.saturating_sub(active),
        }
    }

    /// Validate and enqueue a limit change.
    ///
    /// Both side channels (signals, management endpoint) come through here,
    /// so they share one validator.
    pub fn request_update(&self, new_limit: usize) -> Result<()> {
        if new_limit == 0 {
            return Err(DbError::validation("connection limit must be positive"));
        }
        let active = self.active();
        if new_limit < active {
            return Err(DbError::validation(format!(
                "cannot set limit to {new_limit} when {active} connections are active"
            )));
        }

        self.updates
            .try_send(new_limit)
            .map_err(|_| DbError::validation("limit update channel is full, try again later"))
    }

    /// Apply an accepted limit: build a fresh semaphore holding the new
    /// headroom, swap it in, persist.
    fn apply_update(&self, new_limit: usize) {
        let mut semaphore = self.semaphore.write();

        // Re-check under the lock; connections may have arrived since
        // validation
        let active = self.active();
        if new_limit < active {
            tracing::warn!(
                new_limit,
                active,
                "dropping limit update; active connections exceed it"
            );
            return;
        }

        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);
        *semaphore = Arc::new(Semaphore::new(new_limit - active));
        drop(semaphore);

        tracing::info!(old_limit, new_limit, active, "connection limit updated");

        if let Err(e) = persistence::save_connection_limit(&self.limit_path, new_limit) {
            tracing::warn!(error = %e, "failed to persist connection limit");
        }
    }
}

fn spawn_update_processor(governor: Arc<Governor>, mut updates: mpsc::Receiver<usize>) {
    tokio::spawn(async move {
        while let Some(new_limit) = updates.recv().await {
            governor.apply_update(new_limit);
        }
    });
}

/// SIGUSR1 raises the limit by a fixed delta; SIGUSR2 lowers it, refusing
/// to go below the active connection count.
pub fn spawn_signal_handler(governor: Arc<Governor>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut increase = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGUSR1 handler unavailable");
                return;
            }
        };
        let mut decrease = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGUSR2 handler unavailable");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = increase.recv() => {
                    let new_limit = governor.current_limit() + SIGNAL_LIMIT_DELTA;
                    tracing::info!(new_limit, "SIGUSR1: raising connection limit");
                    if let Err(e) = governor.request_update(new_limit) {
                        tracing::warn!(error = %e, "signal limit update rejected");
                    }
                }
                _ = decrease.recv() => {
                    let current = governor.current_limit();
                    let new_limit = current.saturating_sub(SIGNAL_LIMIT_DELTA).max(1);
                    tracing::info!(new_limit, "SIGUSR2: lowering connection limit");
                    if let Err(e) = governor.request_update(new_limit) {
                        tracing::warn!(error = %e, "signal limit update rejected");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn new_governor(dir: &std::path::Path, limit: usize) -> Arc<Governor> {
        Governor::new(dir.join("connection_limit.json"), limit)
    }

    #[tokio::test]
    async fn test_acquire_until_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let governor = new_governor(dir.path(), 2);

        governor.try_acquire(addr(1)).unwrap();
        governor.try_acquire(addr(2)).unwrap();
        assert!(matches!(
            governor.try_acquire(addr(3)),
            Err(DbError::Capacity { limit: 2 })
        ));

        governor.release(addr(1));
        governor.try_acquire(addr(3)).unwrap();
        assert_eq!(governor.active(), 2);
    }

    #[tokio::test]
    async fn test_update_validation() {
        let dir = tempfile::tempdir().unwrap();
        let governor = new_governor(dir.path(), 2);

        governor.try_acquire(addr(1)).unwrap();
        governor.try_acquire(addr(2)).unwrap();

        // Not positive
        assert!(governor.request_update(0).is_err());
        // Below active
        assert!(governor.request_update(1).is_err());
        // At active is allowed
        governor.request_update(2).unwrap();
    }

    #[tokio::test]
    async fn test_raise_limit_admits_more() {
        let dir = tempfile::tempdir().unwrap();
        let governor = new_governor(dir.path(), 1);

        governor.try_acquire(addr(1)).unwrap();
        assert!(governor.try_acquire(addr(2)).is_err());

        governor.request_update(3).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        governor.try_acquire(addr(2)).unwrap();
        governor.try_acquire(addr(3)).unwrap();
        assert!(governor.try_acquire(addr(4)).is_err());
    }

    #[tokio::test]
    async fn test_lower_limit_keeps_active_permits() {
        let dir = tempfile::tempdir().unwrap();
        let governor = new_governor(dir.path(), 5);

        governor.try_acquire(addr(1)).unwrap();
        governor.try_acquire(addr(2)).unwrap();

        governor.request_update(2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Active sessions keep their permits; no headroom remains
        assert_eq!(governor.active(), 2);
        assert!(governor.try_acquire(addr(3)).is_err());

        // Releasing one frees one slot under the new ceiling
        governor.release(addr(1));
        governor.try_acquire(addr(3)).unwrap();
        assert!(governor.try_acquire(addr(4)).is_err());
    }

    #[tokio::test]
    async fn test_limit_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let governor = new_governor(dir.path(), 10);
            governor.request_update(25).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(governor.current_limit(), 25);
        }

        // A fresh governor seeds itself from the artifact, not the default
        let governor = new_governor(dir.path(), 10);
        assert_eq!(governor.current_limit(), 25);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let governor = new_governor(dir.path(), 4);

        governor.try_acquire(addr(1)).unwrap();
        let stats = governor.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.max_connections, 4);
        assert_eq!(stats.available_slots, 3);
        assert!((stats.usage_percentage - 25.0).abs() < f64::EPSILON);
    }
}
