//! Vector storage engine
//!
//! Durable store of `(id, vector)` pairs with training-aware ANN ingestion.
//!
//! ```text
//! Insert ──► WAL (optional) ──► ANN index ──► persistence queue
//!                 │                 ▲               │
//!                 ▼                 │               ▼ (≤1024 records / 50 ms)
//!              replay ───► pending pools ──►  append-only data file
//!                          (until trained)    + id → offset map
//! ```
//!
//! Descriptors that require training buffer inserts until the training
//! threshold is crossed, then train, bulk-add, and enqueue everything for
//! persistence. A background flusher appends queued records to the data
//! file with a single fsync per drain; a checkpoint worker periodically
//! saves the ANN index and fsyncs the data file.
//!
//! Data-file record: `[u64 id LE]` + `dimension × [f32 LE]`.

mod ann;
mod descriptor;
mod flat;
mod ivf;

pub use ann::{AnnIndex, RangeHits, SearchHits};
pub use descriptor::{Component, Descriptor, Metric};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::wal::{RecordFlag, Wal};

/// Durable vector engine with an ID-mapped ANN index
pub struct VectorEngine {
    dimension: usize,
    record_size: usize,
    index_path: PathBuf,
    wal: Option<Wal>,
    training_threshold: usize,
    inner: RwLock<Inner>,
    /// Records accepted by the index but not yet in the data file
    queue: Mutex<Vec<(i64, Vec<f32>)>>,
    persist_max_batch: usize,
    kick: mpsc::Sender<()>,
    checkpoint_running: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    data_file: File,
    ann: Box<dyn AnnIndex>,
    /// Latest data-file offset per id
    offsets: HashMap<i64, u64>,
    /// Vectors reserved for training
    train_pool: Vec<Vec<f32>>,
    /// id → vector accepted before the index was trained
    pending_add: HashMap<i64, Vec<f32>>,
}

impl VectorEngine {
    /// Open or create the engine: rebuild the offset map, load or create
    /// the ANN index, replay the WAL, and start the background workers.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        data_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        wal_path: impl AsRef<Path>,
        dimension: usize,
        index_type: &str,
        metric: &str,
        wal_enabled: bool,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        if dimension == 0 {
            return Err(DbError::validation("dimension must be positive"));
        }

        let descriptor = Descriptor::parse(index_type)?;
        let metric = Metric::parse(metric)?;
        let index_path = index_path.as_ref().to_path_buf();

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(data_path.as_ref())?;

        let record_size = 8 + 4 * dimension;
        let offsets = rebuild_offsets(&data_file, record_size)?;

        let ann = if index_path.exists() {
            ann::load_index(&index_path, &descriptor, dimension, metric)?
        } else {
            ann::create_index(&descriptor, dimension, metric)
        };

        let wal = if wal_enabled {
            Some(Wal::open(wal_path)?)
        } else {
            None
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (kick, kick_rx) = mpsc::channel(1);

        let engine = Arc::new(Self {
            dimension,
            record_size,
            index_path,
            wal,
            training_threshold: descriptor.training_threshold(),
            inner: RwLock::new(Inner {
                data_file,
                ann,
                offsets,
                train_pool: Vec::new(),
                pending_add: HashMap::new(),
            }),
            queue: Mutex::new(Vec::new()),
            persist_max_batch: config.persist_max_batch,
            kick,
            checkpoint_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        });

        engine.replay_wal()?;
        spawn_persist_flusher(
            Arc::clone(&engine),
            config.persist_max_delay,
            kick_rx,
            shutdown_rx.clone(),
        );
        spawn_checkpointer(Arc::clone(&engine), config.checkpoint_interval, shutdown_rx);

        Ok(engine)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert a vector under `id`. Duplicate ids are last-write-wins.
    pub fn insert(&self, id: i64, vector: &[f32]) -> Result<()> {
        self.ensure_open()?;
        if vector.len() != self.dimension {
            return Err(DbError::validation(format!(
                "vector length mismatch: expected {}",
                self.dimension
            )));
        }

        if let Some(wal) = &self.wal {
            wal.append(&id.to_le_bytes(), &floats_to_bytes(vector))?;
        }

        self.insert_after_wal(id, vector.to_vec())?;

        if let Some(wal) = &self.wal {
            wal.mark_committed()?;
        }
        Ok(())
    }

    /// Ingest without touching the WAL (shared by `insert` and WAL replay)
    fn insert_after_wal(&self, id: i64, vector: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.write();

        let trained = self.training_threshold == 0 || inner.ann.is_trained();
        if trained {
            // Replace any existing row so duplicate ids are last-write-wins
            inner.ann.remove_ids(&[id]);
            inner.ann.add_with_ids(&vector, &[id])?;
            drop(inner);
            self.enqueue_persist(vec![(id, vector)]);
            return Ok(());
        }

        inner.train_pool.push(vector.clone());
        inner.pending_add.insert(id, vector);

        if inner.train_pool.len() >= self.training_threshold {
            let samples: Vec<f32> = inner.train_pool.concat();
            inner.ann.train(&samples)?;

            let mut ids = Vec::with_capacity(inner.pending_add.len());
            let mut data = Vec::with_capacity(inner.pending_add.len() * self.dimension);
            for (&pid, pv) in inner.pending_add.iter() {
                ids.push(pid);
                data.extend_from_slice(pv);
            }
            inner.ann.add_with_ids(&data, &ids)?;

            let pending: Vec<(i64, Vec<f32>)> = inner.pending_add.drain().collect();
            inner.train_pool.clear();
            drop(inner);

            tracing::info!(vectors = pending.len(), "ANN index trained");
            self.enqueue_persist(pending);
        }
        Ok(())
    }

    /// k nearest neighbors; ids are the external ids
    pub fn search_topk(&self, query: &[f32], k: usize) -> Result<SearchHits> {
        self.ensure_open()?;
        self.validate_query(query)?;
        if k == 0 {
            return Err(DbError::validation("k must be positive"));
        }

        self.inner.read().ann.search_topk(query, k)
    }

    /// All neighbors within `radius`, sorted by ascending distance
    pub fn range_search(&self, query: &[f32], radius: f32) -> Result<SearchHits> {
        self.ensure_open()?;
        self.validate_query(query)?;
        if !(radius > 0.0) {
            return Err(DbError::validation("radius must be positive"));
        }

        let hits = self.inner.read().ann.range_search(query, radius)?;

        // The library reports per-query limits; this API issues one query
        if hits.lims.len() != 2 {
            return Err(DbError::invariant(format!(
                "expected 1 query in range search limits, got {}",
                hits.lims.len().saturating_sub(1)
            )));
        }
        let (start, end) = (hits.lims[0], hits.lims[1]);
        if start > end || end > hits.ids.len() || end > hits.distances.len() {
            return Err(DbError::invariant(format!(
                "invalid range search limits [{start},{end}) over {} results",
                hits.ids.len()
            )));
        }

        let mut pairs: Vec<(i64, f32)> = hits.ids[start..end]
            .iter()
            .copied()
            .zip(hits.distances[start..end].iter().copied())
            .collect();
        pairs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(SearchHits {
            ids: pairs.iter().map(|(id, _)| *id).collect(),
            distances: pairs.iter().map(|(_, d)| *d).collect(),
        })
    }

    /// Point lookup by id.
    ///
    /// Consults the persisted offset map first, then the in-flight
    /// persistence queue and the pre-training pool, so an insert is always
    /// observable to its own session.
    pub fn get_vector(&self, id: i64) -> Result<Vec<f32>> {
        self.ensure_open()?;

        {
            let inner = self.inner.read();
            if let Some(&offset) = inner.offsets.get(&id) {
                let mut buf = vec![0u8; self.record_size];
                inner.data_file.read_exact_at(&mut buf, offset)?;
                return bytes_to_floats(&buf[8..]);
            }
            if let Some(vector) = inner.pending_add.get(&id) {
                return Ok(vector.clone());
            }
        }

        if let Some((_, vector)) = self.queue.lock().iter().rev().find(|(qid, _)| *qid == id) {
            return Ok(vector.clone());
        }

        Err(DbError::not_found(format!("vector id {id} not found")))
    }

    /// Persist the ANN index and fsync the data file
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.ann.save(&self.index_path)?;
        inner.data_file.sync_all()?;
        Ok(())
    }

    /// Drain the persistence queue into the data file.
    ///
    /// Returns the number of records written; a single fsync covers the
    /// whole drain.
    pub fn flush_data(&self) -> Result<usize> {
        let drained = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *queue)
        };

        let mut inner = self.inner.write();
        for (id, vector) in &drained {
            let pos = inner.data_file.metadata()?.len();
            let mut buf = Vec::with_capacity(self.record_size);
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&floats_to_bytes(vector));
            inner.data_file.write_all_at(&buf, pos)?;
            inner.offsets.insert(*id, pos);
        }
        inner.data_file.sync_all()?;

        Ok(drained.len())
    }

    /// Drain pending work, checkpoint, and release resources. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        self.flush_data()?;
        self.checkpoint()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::EngineClosed);
        }
        Ok(())
    }

    fn validate_query(&self, query: &[f32]) -> Result<()> {
        if query.len() != self.dimension {
            return Err(DbError::validation(format!(
                "invalid query size: expected {}",
                self.dimension
            )));
        }
        Ok(())
    }

    fn enqueue_persist(&self, records: Vec<(i64, Vec<f32>)>) {
        let kick_needed = {
            let mut queue = self.queue.lock();
            queue.extend(records);
            queue.len() >= self.persist_max_batch
        };
        if kick_needed {
            let _ = self.kick.try_send(());
        }
    }

    /// Replay non-committed WAL records through the ingest path, then
    /// persist, checkpoint, and clear the log.
    fn replay_wal(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let records = wal.replay()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut replayed = 0;
        for record in records {
            if record.flag == RecordFlag::Delete {
                continue;
            }
            let key: [u8; 8] = record.key.as_slice().try_into().map_err(|_| {
                DbError::invariant(format!(
                    "vector WAL key must be 8 bytes, got {}",
                    record.key.len()
                ))
            })?;
            let id = i64::from_le_bytes(key);
            let vector = bytes_to_floats(&record.value)?;
            if vector.len() != self.dimension {
                return Err(DbError::invariant(format!(
                    "vector WAL record for id {id} has dimension {}, expected {}",
                    vector.len(),
                    self.dimension
                )));
            }
            self.insert_after_wal(id, vector)?;
            replayed += 1;
        }

        self.flush_data()?;
        self.checkpoint()?;
        wal.clear()?;
        tracing::info!(records = replayed, "vector WAL replay complete");
        Ok(())
    }
}

/// Scan the data file, keeping the latest offset per id; a truncated tail
/// is ignored
fn rebuild_offsets(file: &File, record_size: usize) -> Result<HashMap<i64, u64>> {
    let len = file.metadata()?.len();
    let mut offsets = HashMap::new();

    let mut offset = 0u64;
    let mut id_buf = [0u8; 8];
    while offset + record_size as u64 <= len {
        file.read_exact_at(&mut id_buf, offset)?;
        offsets.insert(i64::from_le_bytes(id_buf), offset);
        offset += record_size as u64;
    }
    Ok(offsets)
}

fn spawn_persist_flusher(
    engine: Arc<VectorEngine>,
    max_delay: std::time::Duration,
    mut kick: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_delay);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Err(e) = engine.flush_data() {
                        tracing::warn!(error = %e, "final vector persistence flush failed");
                    }
                    break;
                }
                _ = kick.recv() => {
                    if let Err(e) = engine.flush_data() {
                        tracing::warn!(error = %e, "vector persistence flush failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = engine.flush_data() {
                        tracing::warn!(error = %e, "vector persistence flush failed");
                    }
                }
            }
        }
    });
}

fn spawn_checkpointer(
    engine: Arc<VectorEngine>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if engine
                        .checkpoint_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        continue;
                    }
                    if let Err(e) = engine.checkpoint() {
                        tracing::warn!(error = %e, "vector checkpoint failed");
                    }
                    engine.checkpoint_running.store(false, Ordering::SeqCst);
                }
            }
        }
    });
}

pub(crate) fn floats_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub(crate) fn bytes_to_floats(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(DbError::validation(
            "vector byte length must be a multiple of 4",
        ));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}
