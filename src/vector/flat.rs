//! Exact scan index backend
//!
//! Stores rows in contiguous row-major storage with an id → row map and
//! evaluates queries by scanning every row. Serves `Flat` and `HNSW*`
//! descriptors, and descriptors whose only training requirement comes from
//! a `PQ` component — those gate adds behind `train` without changing the
//! scan evaluation.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::{DbError, Result};

use super::ann::{
    save_to, write_rows, AnnIndex, IndexHeader, RangeHits, SearchHits, KIND_SCAN,
};
use super::descriptor::Metric;

pub struct ScanIndex {
    dim: usize,
    metric: Metric,
    requires_training: bool,
    trained: bool,
    ids: Vec<i64>,
    /// Row-major vector storage, `ids.len() * dim` floats
    data: Vec<f32>,
    slots: HashMap<i64, usize>,
}

impl ScanIndex {
    pub fn new(dim: usize, metric: Metric, requires_training: bool) -> Self {
        Self {
            dim,
            metric,
            requires_training,
            trained: false,
            ids: Vec::new(),
            data: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub(super) fn load(
        r: &mut impl Read,
        header: &IndexHeader,
        requires_training: bool,
    ) -> Result<Self> {
        let dim = header.dim as usize;
        let (ids, data) = super::ann::read_rows(r, header.count as usize, dim)?;
        let slots = ids.iter().enumerate().map(|(row, &id)| (id, row)).collect();

        Ok(Self {
            dim,
            metric: header.metric,
            requires_training,
            trained: header.trained,
            ids,
            data,
            slots,
        })
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    fn remove_row(&mut self, row: usize) {
        let last = self.ids.len() - 1;
        self.slots.remove(&self.ids[row]);

        if row != last {
            let moved_id = self.ids[last];
            self.slots.insert(moved_id, row);
            let (head, tail) = self.data.split_at_mut(last * self.dim);
            head[row * self.dim..(row + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
        }
        self.ids.swap_remove(row);
        self.data.truncate(last * self.dim);
    }
}

impl AnnIndex for ScanIndex {
    fn is_trained(&self) -> bool {
        !self.requires_training || self.trained
    }

    fn train(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Err(DbError::validation("no training samples"));
        }
        self.trained = true;
        Ok(())
    }

    fn add_with_ids(&mut self, vectors: &[f32], ids: &[i64]) -> Result<()> {
        if !self.is_trained() {
            return Err(DbError::validation("index is not trained"));
        }
        debug_assert_eq!(vectors.len(), ids.len() * self.dim);

        for (i, &id) in ids.iter().enumerate() {
            let vector = &vectors[i * self.dim..(i + 1) * self.dim];
            match self.slots.get(&id) {
                Some(&row) => {
                    self.data[row * self.dim..(row + 1) * self.dim].copy_from_slice(vector);
                }
                None => {
                    self.slots.insert(id, self.ids.len());
                    self.ids.push(id);
                    self.data.extend_from_slice(vector);
                }
            }
        }
        Ok(())
    }

    fn remove_ids(&mut self, ids: &[i64]) -> usize {
        let mut removed = 0;
        for id in ids {
            let row = self.slots.get(id).copied();
            if let Some(row) = row {
                self.remove_row(row);
                removed += 1;
            }
        }
        removed
    }

    fn search_topk(&self, query: &[f32], k: usize) -> Result<SearchHits> {
        let mut scored: Vec<(i64, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, &id)| (id, self.metric.distance(query, self.row(row))))
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(SearchHits {
            ids: scored.iter().map(|(id, _)| *id).collect(),
            distances: scored.iter().map(|(_, d)| *d).collect(),
        })
    }

    fn range_search(&self, query: &[f32], radius: f32) -> Result<RangeHits> {
        let mut ids = Vec::new();
        let mut distances = Vec::new();

        for (row, &id) in self.ids.iter().enumerate() {
            let d = self.metric.distance(query, self.row(row));
            if d <= radius {
                ids.push(id);
                distances.push(d);
            }
        }

        let lims = vec![0, ids.len()];
        Ok(RangeHits {
            ids,
            distances,
            lims,
        })
    }

    fn ntotal(&self) -> usize {
        self.ids.len()
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_to(path, |w| {
            IndexHeader {
                kind: KIND_SCAN,
                metric: self.metric,
                trained: self.trained,
                dim: self.dim as u32,
                count: self.ids.len() as u64,
            }
            .write(w)?;
            write_rows(w, &self.ids, &self.data, self.dim)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with_rows() -> ScanIndex {
        let mut index = ScanIndex::new(2, Metric::L2, false);
        index
            .add_with_ids(&[0.0, 0.0, 1.0, 0.0, 5.0, 5.0], &[10, 20, 30])
            .unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = index_with_rows();
        let hits = index.search_topk(&[0.9, 0.0], 3).unwrap();
        assert_eq!(hits.ids, vec![20, 10, 30]);
        assert!(hits.distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_search_truncates_to_k() {
        let index = index_with_rows();
        let hits = index.search_topk(&[0.0, 0.0], 1).unwrap();
        assert_eq!(hits.ids, vec![10]);
    }

    #[test]
    fn test_add_existing_id_overwrites() {
        let mut index = index_with_rows();
        index.add_with_ids(&[100.0, 100.0], &[10]).unwrap();
        assert_eq!(index.ntotal(), 3);

        let hits = index.search_topk(&[100.0, 100.0], 1).unwrap();
        assert_eq!(hits.ids, vec![10]);
    }

    #[test]
    fn test_remove_ids() {
        let mut index = index_with_rows();
        assert_eq!(index.remove_ids(&[20, 999]), 1);
        assert_eq!(index.ntotal(), 2);

        let hits = index.search_topk(&[1.0, 0.0], 3).unwrap();
        assert!(!hits.ids.contains(&20));
    }

    #[test]
    fn test_range_search_bounds() {
        let index = index_with_rows();
        let hits = index.range_search(&[0.0, 0.0], 1.5).unwrap();
        assert_eq!(hits.lims, vec![0, 2]);
        assert!(hits.ids.contains(&10));
        assert!(hits.ids.contains(&20));
        assert!(!hits.ids.contains(&30));
    }

    #[test]
    fn test_training_gate() {
        let mut index = ScanIndex::new(2, Metric::L2, true);
        assert!(!index.is_trained());
        assert!(index.add_with_ids(&[0.0, 0.0], &[1]).is_err());

        index.train(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!(index.is_trained());
        index.add_with_ids(&[0.0, 0.0], &[1]).unwrap();
        assert_eq!(index.ntotal(), 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.ann");

        let index = index_with_rows();
        index.save(&path).unwrap();

        let mut reader = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let header = IndexHeader::read(&mut reader).unwrap();
        let loaded = ScanIndex::load(&mut reader, &header, false).unwrap();

        assert_eq!(loaded.ntotal(), 3);
        let hits = loaded.search_topk(&[5.0, 5.0], 1).unwrap();
        assert_eq!(hits.ids, vec![30]);
    }
}
