//! ANN index capability trait
//!
//! The vector engine consumes the ANN index as a capability set: training
//! state, ID-mapped add/remove, top-k and range search, and save/load. The
//! trait is the swap point for a production backend; the crate ships two
//! implementations behind it (`ScanIndex`, `IvfIndex`), selected from the
//! index descriptor.
//!
//! Persisted index file layout (little-endian):
//! ┌───────┬─────┬──────┬────────┬─────────┬─────┬───────┬──────────────────┐
//! │ Magic │ Ver │ Kind │ Metric │ Trained │ Dim │ Count │ Backend payload  │
//! │ 4     │ 1   │ 1    │ 1      │ 1       │ 4   │ 8     │ ...              │
//! └───────┴─────┴──────┴────────┴─────────┴─────┴───────┴──────────────────┘
//! Rows are `[i64 id][dim × f32]`; the IVF payload prepends `nlist` and the
//! centroid matrix.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{DbError, Result};

use super::descriptor::{Descriptor, Metric};
use super::flat::ScanIndex;
use super::ivf::IvfIndex;

pub const INDEX_MAGIC: &[u8; 4] = b"FANN";
pub const INDEX_VERSION: u8 = 1;

pub const KIND_SCAN: u8 = 0;
pub const KIND_IVF: u8 = 1;

/// Top-k search output: parallel id/distance arrays
#[derive(Debug, Clone, Default)]
pub struct SearchHits {
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
}

/// Range search output in the library's per-query shape.
///
/// `lims` has one more entry than the number of queries; query `q`'s results
/// occupy `ids[lims[q]..lims[q+1]]`.
#[derive(Debug, Clone)]
pub struct RangeHits {
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
    pub lims: Vec<usize>,
}

/// Capability interface over an ID-mapped ANN index
pub trait AnnIndex: Send + Sync {
    /// True once the index has been trained (always true when the
    /// descriptor requires no training)
    fn is_trained(&self) -> bool;

    /// Train on `samples` — concatenated row-major vectors
    fn train(&mut self, samples: &[f32]) -> Result<()>;

    /// Add vectors (concatenated row-major) under the given external ids
    fn add_with_ids(&mut self, vectors: &[f32], ids: &[i64]) -> Result<()>;

    /// Remove the given ids; returns how many rows were dropped
    fn remove_ids(&mut self, ids: &[i64]) -> usize;

    /// k nearest neighbors of `query`, closest first
    fn search_topk(&self, query: &[f32], k: usize) -> Result<SearchHits>;

    /// All rows within `radius` of `query`, in the per-query lims shape
    fn range_search(&self, query: &[f32], radius: f32) -> Result<RangeHits>;

    /// Number of indexed rows
    fn ntotal(&self) -> usize;

    /// Persist the index to `path`
    fn save(&self, path: &Path) -> Result<()>;
}

/// Create a fresh index for the descriptor
pub fn create_index(
    descriptor: &Descriptor,
    dimension: usize,
    metric: Metric,
) -> Box<dyn AnnIndex> {
    match descriptor.ivf_nlist() {
        Some(nlist) => Box::new(IvfIndex::new(dimension, metric, nlist as usize)),
        None => Box::new(ScanIndex::new(
            dimension,
            metric,
            descriptor.training_threshold() > 0,
        )),
    }
}

/// Load a persisted index, dispatching on the kind byte in its header
pub fn load_index(
    path: &Path,
    descriptor: &Descriptor,
    dimension: usize,
    metric: Metric,
) -> Result<Box<dyn AnnIndex>> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = IndexHeader::read(&mut reader)?;

    if header.dim as usize != dimension {
        return Err(DbError::invariant(format!(
            "index file has dimension {}, space expects {dimension}",
            header.dim
        )));
    }

    match header.kind {
        KIND_SCAN => Ok(Box::new(ScanIndex::load(
            &mut reader,
            &header,
            descriptor.training_threshold() > 0,
        )?)),
        KIND_IVF => Ok(Box::new(IvfIndex::load(&mut reader, &header)?)),
        other => Err(DbError::invariant(format!(
            "unknown index kind {other} in {}",
            path.display()
        ))),
    }
}

/// Fixed-size header shared by every backend
pub(super) struct IndexHeader {
    pub kind: u8,
    pub metric: Metric,
    pub trained: bool,
    pub dim: u32,
    pub count: u64,
}

impl IndexHeader {
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(INDEX_MAGIC)?;
        w.write_all(&[INDEX_VERSION, self.kind, self.metric.code(), self.trained as u8])?;
        w.write_all(&self.dim.to_le_bytes())?;
        w.write_all(&self.count.to_le_bytes())?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(DbError::invariant("bad index file magic".to_string()));
        }

        let mut fixed = [0u8; 4];
        r.read_exact(&mut fixed)?;
        let [version, kind, metric_code, trained] = fixed;
        if version != INDEX_VERSION {
            return Err(DbError::invariant(format!(
                "unsupported index file version {version}"
            )));
        }

        let mut dim = [0u8; 4];
        r.read_exact(&mut dim)?;
        let mut count = [0u8; 8];
        r.read_exact(&mut count)?;

        Ok(Self {
            kind,
            metric: Metric::from_code(metric_code)?,
            trained: trained != 0,
            dim: u32::from_le_bytes(dim),
            count: u64::from_le_bytes(count),
        })
    }
}

/// Write `count` rows of `[id][vector]` from parallel storage
pub(super) fn write_rows(
    w: &mut impl Write,
    ids: &[i64],
    data: &[f32],
    dim: usize,
) -> Result<()> {
    for (row, &id) in ids.iter().enumerate() {
        w.write_all(&id.to_le_bytes())?;
        for &v in &data[row * dim..(row + 1) * dim] {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Read `count` rows into parallel id/data storage
pub(super) fn read_rows(
    r: &mut impl Read,
    count: usize,
    dim: usize,
) -> Result<(Vec<i64>, Vec<f32>)> {
    let mut ids = Vec::with_capacity(count);
    let mut data = Vec::with_capacity(count * dim);

    let mut id_buf = [0u8; 8];
    let mut f_buf = [0u8; 4];
    for _ in 0..count {
        r.read_exact(&mut id_buf)?;
        ids.push(i64::from_le_bytes(id_buf));
        for _ in 0..dim {
            r.read_exact(&mut f_buf)?;
            data.push(f32::from_le_bytes(f_buf));
        }
    }
    Ok((ids, data))
}

pub(super) fn write_floats(w: &mut impl Write, values: &[f32]) -> Result<()> {
    for &v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub(super) fn read_floats(r: &mut impl Read, count: usize) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        r.read_exact(&mut buf)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

/// Shared save entry point used by the backends
pub(super) fn save_to(path: &Path, write_payload: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_payload(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}
