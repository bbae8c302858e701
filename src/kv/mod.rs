//! Key-value storage engine
//!
//! Durable, crash-consistent string-to-string store. Writes land in an
//! in-memory batch and are coalesced to disk by a periodic flush; reads
//! consult the batch first so a session always observes its own writes.
//!
//! Flush ordering: WAL records first, then data-file records and index
//! updates, then one fsync, then the WAL commit mark. On open the engine
//! reloads the key index and replays any non-committed WAL records through
//! the batch path before serving requests.
//!
//! Data-file record: `[u32 key-size LE][u32 value-size LE]` + key + value.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::defaults::TOMBSTONE;
use crate::error::{DbError, Result};
use crate::index::KeyIndex;
use crate::wal::{RecordFlag, Wal};

const RECORD_HEADER: usize = 8;

/// Durable key-value engine with a write-coalescing batch
pub struct KvEngine {
    file: File,
    /// Engine-wide lock: readers of the data file vs flush/delete writers
    engine_lock: RwLock<()>,
    index: KeyIndex,
    wal: Wal,
    /// Pending writes, keyed last-write-wins
    batch: Mutex<HashMap<String, String>>,
    flush_running: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl KvEngine {
    /// Open or create the engine, replay the WAL, and start the flush ticker
    pub fn open(
        data_path: impl AsRef<Path>,
        wal_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        flush_interval: Duration,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(data_path.as_ref())?;

        let index = KeyIndex::open(index_path)?;
        let wal = Wal::open(wal_path)?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(Self {
            file,
            engine_lock: RwLock::new(()),
            index,
            wal,
            batch: Mutex::new(HashMap::new()),
            flush_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        });

        engine.replay_wal()?;
        spawn_flush_ticker(Arc::clone(&engine), flush_interval, shutdown_rx);

        Ok(engine)
    }

    /// Stage a write; durability is achieved at flush time
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.batch.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Read the latest value for `key`
    pub fn get(&self, key: &str) -> Result<String> {
        self.ensure_open()?;

        // Batch first for read-your-own-writes
        if let Some(value) = self.batch.lock().get(key) {
            return Ok(value.clone());
        }

        let _guard = self.engine_lock.read();

        let pos = self
            .index
            .get(key.as_bytes())
            .ok_or_else(|| DbError::not_found("key not found"))?;

        let mut header = [0u8; RECORD_HEADER];
        self.file.read_exact_at(&mut header, pos)?;
        let key_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let value_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

        let mut key_bytes = vec![0u8; key_size];
        self.file.read_exact_at(&mut key_bytes, pos + RECORD_HEADER as u64)?;

        if key_bytes != key.as_bytes() {
            return Err(DbError::invariant(format!(
                "record at offset {pos} holds key {:?}, index expected {key:?}",
                String::from_utf8_lossy(&key_bytes)
            )));
        }

        let mut value_bytes = vec![0u8; value_size];
        self.file
            .read_exact_at(&mut value_bytes, pos + (RECORD_HEADER + key_size) as u64)?;

        let value = String::from_utf8(value_bytes)
            .map_err(|_| DbError::invariant(format!("non-UTF-8 value at offset {pos}")))?;

        if value == TOMBSTONE {
            return Err(DbError::not_found("key is deleted"));
        }
        Ok(value)
    }

    /// Delete `key`: WAL delete record, index removal, tombstone-shaped append
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.engine_lock.write();

        if self.index.get(key.as_bytes()).is_none() {
            return Err(DbError::not_found("key not found"));
        }

        self.wal.append_delete(key.as_bytes())?;
        self.index.remove(key.as_bytes())?;
        self.append_record(key.as_bytes(), b"")?;
        Ok(())
    }

    /// Snapshot and persist the batch.
    ///
    /// Returns the number of records written. WAL writes precede data-file
    /// writes; index entries become visible only after the record they point
    /// at is fully written.
    pub fn flush(&self) -> Result<usize> {
        let snapshot = {
            let mut batch = self.batch.lock();
            if batch.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *batch)
        };

        let _guard = self.engine_lock.write();

        for (key, value) in &snapshot {
            self.wal.append(key.as_bytes(), value.as_bytes())?;
        }

        for (key, value) in &snapshot {
            let pos = self.append_record(key.as_bytes(), value.as_bytes())?;
            self.index.add(key.as_bytes(), pos)?;
        }

        self.file.sync_all()?;
        self.wal.mark_committed()?;
        if self.wal.should_checkpoint() {
            self.wal.clear()?;
        }

        Ok(snapshot.len())
    }

    /// Stop the flush ticker, flush pending writes, and release files.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        self.flush()?;
        self.wal.clear()?;
        self.index.close()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::EngineClosed);
        }
        Ok(())
    }

    /// Append one record at the end of the data file; caller holds the write lock
    fn append_record(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let pos = self.file.metadata()?.len();

        let mut buf = Vec::with_capacity(RECORD_HEADER + key.len() + value.len());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        self.file.write_all_at(&buf, pos)?;
        Ok(pos)
    }

    /// Re-insert non-committed WAL records through the batch path and flush
    fn replay_wal(&self) -> Result<()> {
        let records = self.wal.replay()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut replayed = 0;
        for record in records {
            if record.flag == RecordFlag::Delete || record.value.is_empty() {
                continue;
            }
            let key = String::from_utf8_lossy(&record.key).into_owned();
            let value = String::from_utf8_lossy(&record.value).into_owned();
            self.batch.lock().insert(key, value);
            replayed += 1;
        }

        self.flush()?;
        self.wal.clear()?;
        tracing::info!(records = replayed, "key-value WAL replay complete");
        Ok(())
    }
}

fn spawn_flush_ticker(
    engine: Arc<KvEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if engine
                        .flush_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        continue;
                    }
                    if let Err(e) = engine.flush() {
                        tracing::warn!(error = %e, "periodic key-value flush failed");
                    }
                    engine.flush_running.store(false, Ordering::SeqCst);
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_engine(dir: &Path) -> Arc<KvEngine> {
        KvEngine::open(
            dir.join("data.db"),
            dir.join("wal.db"),
            dir.join("index.dat"),
            Duration::from_secs(3600), // ticker out of the way; tests flush explicitly
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        engine.put("user:1", "alice").unwrap();
        // No flush has run; the batch must serve the read
        assert_eq!(engine.get("user:1").unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_get_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        engine.put("user:1", "alice").unwrap();
        engine.put("user:2", "bob").unwrap();
        assert_eq!(engine.flush().unwrap(), 2);

        assert_eq!(engine.get("user:1").unwrap(), "alice");
        assert_eq!(engine.get("user:2").unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_overwrite_returns_latest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        engine.put("key", "v1").unwrap();
        engine.flush().unwrap();
        engine.put("key", "v2").unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.get("key").unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        assert!(matches!(engine.get("nope"), Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        engine.put("key", "value").unwrap();
        engine.flush().unwrap();
        engine.delete("key").unwrap();

        assert!(matches!(engine.get("key"), Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        assert!(matches!(engine.delete("nope"), Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let engine = open_engine(dir.path());
            engine.put("user:1", "alice").unwrap();
            engine.flush().unwrap();
            engine.close().unwrap();
        }

        let engine = open_engine(dir.path());
        assert_eq!(engine.get("user:1").unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_delete_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let engine = open_engine(dir.path());
            engine.put("user:1", "alice").unwrap();
            engine.flush().unwrap();
            engine.delete("user:1").unwrap();
            engine.close().unwrap();
        }

        let engine = open_engine(dir.path());
        assert!(matches!(engine.get("user:1"), Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_wal_replay_recovers_unflushed_batch() {
        let dir = tempfile::tempdir().unwrap();

        // Write WAL records without the data file ever seeing them, as if
        // the process died between the WAL fsync and the data-file writes.
        {
            let wal = Wal::open(dir.path().join("wal.db")).unwrap();
            wal.append(b"crashed", b"survivor").unwrap();
        }

        let engine = open_engine(dir.path());
        assert_eq!(engine.get("crashed").unwrap(), "survivor");

        // Replay ends with a cleared WAL
        let wal = Wal::open(dir.path().join("wal.db")).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());

        engine.put("key", "value").unwrap();
        engine.close().unwrap();
        engine.close().unwrap();

        assert!(matches!(engine.put("key", "v2"), Err(DbError::EngineClosed)));
        assert!(matches!(engine.get("key"), Err(DbError::EngineClosed)));
    }

    #[tokio::test]
    async fn test_periodic_flush_runs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = KvEngine::open(
            dir.path().join("data.db"),
            dir.path().join("wal.db"),
            dir.path().join("index.dat"),
            Duration::from_millis(20),
        )
        .unwrap();

        engine.put("ticked", "yes").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The batch is empty because the ticker flushed it
        assert!(engine.batch.lock().is_empty());
        assert_eq!(engine.get("ticked").unwrap(), "yes");
    }
}
