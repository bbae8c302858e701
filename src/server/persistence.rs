//! Persistent connection limit
//!
//! The most recently accepted limit is written through to a small JSON
//! artifact so restarts resume with the operator's last choice.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionLimitConfig {
    max_connections: usize,
    last_updated: u64,
}

/// Write the accepted limit with a unix-seconds timestamp
pub fn save_connection_limit(path: &Path, limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = ConnectionLimitConfig {
        max_connections: limit,
        last_updated: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };

    std::fs::write(path, serde_json::to_vec_pretty(&config)?)?;
    tracing::debug!(limit, path = %path.display(), "connection limit persisted");
    Ok(())
}

/// Load the persisted limit; absent or non-positive values yield `None`
pub fn load_connection_limit(path: &Path) -> Result<Option<usize>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let config: ConnectionLimitConfig = serde_json::from_slice(&data)?;
    Ok((config.max_connections > 0).then_some(config.max_connections))
}
