//! Configuration module
//!
//! One explicit `Config` value carries every path and tuning knob; all
//! subsystems are constructed from it instead of reading globals.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Main configuration for a FerroDB server instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding per-space data and the namespace catalog
    pub data_dir: PathBuf,

    /// Path of the JSON user store
    pub users_path: PathBuf,

    /// Path of the persisted connection-limit artifact
    pub limit_path: PathBuf,

    /// Path of the pid file written by `start`
    pub pid_path: PathBuf,

    /// Directory for the background server log
    pub log_dir: PathBuf,

    /// TCP data port
    pub port: u16,

    /// Management HTTP port (data port + 1000 unless overridden)
    pub management_port: u16,

    /// Startup connection limit (a persisted limit takes precedence)
    pub max_connections: usize,

    pub engine: EngineConfig,
}

/// Engine tuning knobs shared by both storage engines
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between key-value batch flushes
    pub kv_flush_interval: Duration,

    /// Pending vector records that force a persistence flush
    pub persist_max_batch: usize,

    /// Longest a queued vector record waits before being persisted
    pub persist_max_delay: Duration,

    /// Interval between ANN index checkpoints
    pub checkpoint_interval: Duration,

    /// bcrypt cost for stored passwords
    pub bcrypt_cost: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kv_flush_interval: defaults::KV_FLUSH_INTERVAL,
            persist_max_batch: defaults::VECTOR_PERSIST_MAX_BATCH,
            persist_max_delay: defaults::VECTOR_PERSIST_MAX_DELAY,
            checkpoint_interval: defaults::VECTOR_CHECKPOINT_INTERVAL,
            bcrypt_cost: defaults::BCRYPT_COST,
        }
    }
}

impl Config {
    /// Build a config for the given port, honoring environment overrides
    ///
    /// `FERRODB_HOME` relocates the whole state directory; individual paths
    /// follow the layout `<home>/{data,users.json,connection_limit.json,...}`.
    pub fn for_port(port: u16, max_connections: usize) -> anyhow::Result<Self> {
        let home = std::env::var("FERRODB_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        Ok(Self {
            data_dir: home.join("data"),
            users_path: home.join("users.json"),
            limit_path: home.join("connection_limit.json"),
            pid_path: home.join("ferrodb.pid"),
            log_dir: home.join("log"),
            port,
            management_port: port
                .checked_add(defaults::MANAGEMENT_PORT_OFFSET)
                .ok_or_else(|| anyhow::anyhow!("port {} leaves no room for the management port", port))?,
            max_connections,
            engine: EngineConfig::default(),
        })
    }

    /// Config rooted at an explicit directory (used by tests)
    pub fn with_home(home: impl Into<PathBuf>, port: u16, max_connections: usize) -> Self {
        let home = home.into();
        Self {
            data_dir: home.join("data"),
            users_path: home.join("users.json"),
            limit_path: home.join("connection_limit.json"),
            pid_path: home.join("ferrodb.pid"),
            log_dir: home.join("log"),
            port,
            management_port: port.saturating_add(defaults::MANAGEMENT_PORT_OFFSET),
            max_connections,
            engine: EngineConfig::default(),
        }
    }
}

fn default_home() -> PathBuf {
    PathBuf::from("/usr/local/var/lib/ferrodb")
}
