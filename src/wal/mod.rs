//! Write-Ahead Log
//!
//! Per-engine append-only journal of pending mutations. Durability contract:
//! every append is followed by an fsync before control returns, so a crash
//! immediately after a write leaves a durable pending record.
//!
//! Commit marking rewrites the flag byte of the first record in place; the
//! engines call it after a batch has been made durable in their own data
//! files so replay can skip already-applied work. Recovery replays every
//! record whose flag is not `C`, in append order, then truncates.

mod record;

pub use record::{RecordFlag, WalRecord};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::defaults::WAL_CHECKPOINT_THRESHOLD;
use crate::error::Result;

/// Append-only write-ahead log backed by a single file
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Wal {
    /// Open or create the WAL at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Append a pending record and fsync
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_frame(&WalRecord::encode(key, value, RecordFlag::Pending))
    }

    /// Append a delete record (key only) and fsync
    pub fn append_delete(&self, key: &[u8]) -> Result<()> {
        self.write_frame(&WalRecord::encode(key, b"", RecordFlag::Delete))
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(frame)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the first record's flag byte to `C` and fsync.
    ///
    /// The flag byte sits at file offset 8. A log too short to hold a full
    /// header has nothing to commit and the call is a no-op.
    pub fn mark_committed(&self) -> Result<()> {
        let file = self.file.lock();
        if file.metadata()?.len() < 9 {
            return Ok(());
        }
        file.write_all_at(&[RecordFlag::Committed.as_byte()], 8)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read every non-committed record in append order.
    ///
    /// A truncated tail (partial header, or a header whose lengths exceed
    /// the remaining bytes) ends the scan silently.
    pub fn replay(&self) -> Result<Vec<WalRecord>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while let Some((record, consumed)) = WalRecord::decode(&data[offset..])? {
            offset += consumed;
            if record.flag == RecordFlag::Committed {
                continue;
            }
            entries.push(record);
        }

        if offset < data.len() {
            tracing::warn!(
                path = %self.path.display(),
                tail_bytes = data.len() - offset,
                "ignoring truncated WAL tail"
            );
        }

        Ok(entries)
    }

    /// Truncate the log to zero length
    pub fn clear(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        Ok(())
    }

    /// True when the log has grown past the checkpoint threshold
    pub fn should_checkpoint(&self) -> bool {
        self.size().map(|s| s > WAL_CHECKPOINT_THRESHOLD).unwrap_or(false)
    }

    /// Current log size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.db")).unwrap();
        (dir, wal)
    }

    #[test]
    fn test_append_and_replay() {
        let (_dir, wal) = temp_wal();

        wal.append(b"k1", b"v1").unwrap();
        wal.append(b"k2", b"v2").unwrap();
        wal.append_delete(b"k3").unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, b"k1");
        assert_eq!(entries[0].flag, RecordFlag::Pending);
        assert_eq!(entries[2].key, b"k3");
        assert_eq!(entries[2].flag, RecordFlag::Delete);
    }

    #[test]
    fn test_mark_committed_skips_first_record() {
        let (_dir, wal) = temp_wal();

        wal.append(b"k1", b"v1").unwrap();
        wal.append(b"k2", b"v2").unwrap();
        wal.mark_committed().unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"k2");
    }

    #[test]
    fn test_mark_committed_on_empty_log() {
        let (_dir, wal) = temp_wal();
        wal.mark_committed().unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn test_clear_truncates() {
        let (_dir, wal) = temp_wal();

        wal.append(b"k1", b"v1").unwrap();
        wal.clear().unwrap();

        assert_eq!(wal.size().unwrap(), 0);
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn test_replay_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");

        {
            let wal = Wal::open(&path).unwrap();
            wal.append(b"k1", b"v1").unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"v1");
    }

    #[test]
    fn test_truncated_tail_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");

        {
            let wal = Wal::open(&path).unwrap();
            wal.append(b"k1", b"v1").unwrap();
        }

        // Simulate a crash mid-append: a header promising more bytes than exist
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let partial = WalRecord::encode(b"k2", b"v2", RecordFlag::Pending);
            file.write_all(&partial[..partial.len() - 3]).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"k1");
    }

    #[test]
    fn test_should_checkpoint_threshold() {
        let (_dir, wal) = temp_wal();
        assert!(!wal.should_checkpoint());

        let value = vec![0u8; 64 * 1024];
        for i in 0..17 {
            wal.append(format!("key-{i}").as_bytes(), &value).unwrap();
        }
        assert!(wal.should_checkpoint());
    }
}
