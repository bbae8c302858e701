//! Fixed sizes, thresholds, and tuning defaults
//!
//! On-disk header sizes, checkpoint and batching thresholds, server
//! timeouts, and the hashing cost live here in one place. Anything that
//! shapes a file format or a durability guarantee is a constant; knobs a
//! deployment might reasonably tune also flow through `EngineConfig`.

use std::time::Duration;

// ============================================================================
// Write-Ahead Log
// ============================================================================

/// WAL record header size: key size (4) + value size (4) + flag (1)
pub const WAL_HEADER_SIZE: usize = 9;

/// WAL size above which engines should checkpoint and truncate
pub const WAL_CHECKPOINT_THRESHOLD: u64 = 1024 * 1024;

// ============================================================================
// Key Index
// ============================================================================

/// Initial capacity of the memory-mapped key index file
pub const KEY_INDEX_INITIAL_CAPACITY: u64 = 4096;

/// Key index entry header size: key size (4) + offset (8)
pub const KEY_INDEX_ENTRY_HEADER: usize = 12;

// ============================================================================
// Key-Value Engine
// ============================================================================

/// Interval between automatic batch flushes
pub const KV_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Reserved value marking a deleted key in the data file
pub const TOMBSTONE: &str = "__deleted__";

// ============================================================================
// Vector Engine
// ============================================================================

/// Pending records that force a persistence flush
pub const VECTOR_PERSIST_MAX_BATCH: usize = 1024;

/// Longest a queued vector record waits before being persisted
pub const VECTOR_PERSIST_MAX_DELAY: Duration = Duration::from_millis(50);

/// Interval between ANN index checkpoints
pub const VECTOR_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum training samples required once a descriptor contains a PQ component
pub const PQ_MIN_TRAIN: usize = 256;

// ============================================================================
// Server
// ============================================================================

/// Default maximum concurrent client connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Offset added to the data port to derive the management port
pub const MANAGEMENT_PORT_OFFSET: u16 = 1000;

/// Per-read timeout on client sessions
pub const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection-limit delta applied by SIGUSR1/SIGUSR2
pub const SIGNAL_LIMIT_DELTA: usize = 100;

/// Interval between connection-stats log lines
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Identity
// ============================================================================

/// bcrypt cost for stored passwords
pub const BCRYPT_COST: u32 = 12;
