//! Persistent key index
//!
//! Ordered map from key bytes to the 64-bit offset of the record's header in
//! the engine data file. Entries are appended to a memory-mapped journal so
//! the in-memory map can be rebuilt in a single linear scan on open:
//!
//! ┌──────────┬──────────┬───────────┐
//! │ KeySize  │ Offset   │ Key Bytes │
//! │ 4 bytes  │ 8 bytes  │ key-size  │
//! └──────────┴──────────┴───────────┘
//!
//! The mapped file is zero-filled past the write offset; a zero key size
//! terminates the load scan. Removal rewrites the journal from the live map.
//!
//! Offsets are persisted as 64 bits so data files are not capped at 4 GiB.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::defaults::{KEY_INDEX_ENTRY_HEADER, KEY_INDEX_INITIAL_CAPACITY};
use crate::error::Result;

/// Ordered key → data-file-offset map persisted to a memory-mapped journal
pub struct KeyIndex {
    /// Ground truth within the process; replayed from the file on open
    map: RwLock<BTreeMap<Vec<u8>, u64>>,
    /// Guards the mapping against concurrent grow/remap
    mapping: Mutex<Mapping>,
}

struct Mapping {
    file: File,
    mmap: MmapMut,
    write_offset: usize,
}

impl KeyIndex {
    /// Open or create the index, rebuilding the in-memory map from the file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        if file.metadata()?.len() == 0 {
            file.set_len(KEY_INDEX_INITIAL_CAPACITY)?;
        }

        // SAFETY: the engine exclusively owns this file handle; no other
        // process maps or truncates it while the index is open.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut map = BTreeMap::new();
        let write_offset = load_entries(&mmap, &mut map);

        Ok(Self {
            map: RwLock::new(map),
            mapping: Mutex::new(Mapping {
                file,
                mmap,
                write_offset,
            }),
        })
    }

    /// Insert or update the offset for `key`
    pub fn add(&self, key: &[u8], offset: u64) -> Result<()> {
        let mut map = self.map.write();
        map.insert(key.to_vec(), offset);

        let mut mapping = self.mapping.lock();
        append_entry(&mut mapping, key, offset)?;
        mapping.mmap.flush()?;
        Ok(())
    }

    /// Look up the data-file offset for `key`
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.map.read().get(key).copied()
    }

    /// Remove `key`, rewriting the journal from the surviving entries
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut map = self.map.write();
        if map.remove(key).is_none() {
            return Ok(());
        }

        let entries: Vec<(Vec<u8>, u64)> =
            map.iter().map(|(k, &v)| (k.clone(), v)).collect();

        let mut mapping = self.mapping.lock();
        mapping.file.set_len(0)?;
        mapping.file.set_len(KEY_INDEX_INITIAL_CAPACITY)?;
        // SAFETY: same exclusive-ownership argument as in `open`.
        mapping.mmap = unsafe { MmapMut::map_mut(&mapping.file)? };
        mapping.write_offset = 0;

        for (key, offset) in &entries {
            append_entry(&mut mapping, key, *offset)?;
        }
        mapping.mmap.flush()?;
        Ok(())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Flush the mapping to disk
    pub fn close(&self) -> Result<()> {
        self.mapping.lock().mmap.flush()?;
        Ok(())
    }
}

/// Scan the mapped journal, filling `map`; returns the logical end offset
fn load_entries(mmap: &MmapMut, map: &mut BTreeMap<Vec<u8>, u64>) -> usize {
    let mut offset = 0;
    while offset + KEY_INDEX_ENTRY_HEADER <= mmap.len() {
        let key_size =
            u32::from_le_bytes(mmap[offset..offset + 4].try_into().unwrap()) as usize;
        if key_size == 0 {
            break;
        }

        let pos = u64::from_le_bytes(mmap[offset + 4..offset + 12].try_into().unwrap());
        let key_start = offset + KEY_INDEX_ENTRY_HEADER;
        if key_start + key_size > mmap.len() {
            break;
        }

        map.insert(mmap[key_start..key_start + key_size].to_vec(), pos);
        offset = key_start + key_size;
    }
    offset
}

/// Append one entry at the write offset, growing the mapping as needed
fn append_entry(mapping: &mut Mapping, key: &[u8], offset: u64) -> Result<()> {
    let entry_size = KEY_INDEX_ENTRY_HEADER + key.len();

    if mapping.write_offset + entry_size > mapping.mmap.len() {
        let new_size =
            (mapping.mmap.len() * 2 + entry_size) as u64 + KEY_INDEX_INITIAL_CAPACITY;
        mapping.file.set_len(new_size)?;
        // SAFETY: same exclusive-ownership argument as in `open`.
        mapping.mmap = unsafe { MmapMut::map_mut(&mapping.file)? };
    }

    let at = mapping.write_offset;
    mapping.mmap[at..at + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    mapping.mmap[at + 4..at + 12].copy_from_slice(&offset.to_le_bytes());
    mapping.mmap[at + 12..at + 12 + key.len()].copy_from_slice(key);
    mapping.write_offset += entry_size;
    Ok(())
}
