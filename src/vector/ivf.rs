//! Inverted-list index backend
//!
//! Serves descriptors with an `IVF{n}` component. Training runs Lloyd
//! iterations over the sample pool to place `nlist` centroids; each added
//! row is assigned to its nearest centroid's list, and queries probe the
//! `nprobe` nearest lists.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{DbError, Result};

use super::ann::{
    read_floats, save_to, write_floats, write_rows, AnnIndex, IndexHeader, RangeHits,
    SearchHits, KIND_IVF,
};
use super::descriptor::Metric;

const KMEANS_ITERATIONS: usize = 10;
const DEFAULT_NPROBE: usize = 8;

pub struct IvfIndex {
    dim: usize,
    metric: Metric,
    nlist: usize,
    nprobe: usize,
    trained: bool,
    /// `nlist * dim` floats once trained
    centroids: Vec<f32>,
    ids: Vec<i64>,
    data: Vec<f32>,
    slots: HashMap<i64, usize>,
    /// Row index → list index
    assignments: Vec<usize>,
    /// Per-centroid row indices
    lists: Vec<Vec<usize>>,
}

impl IvfIndex {
    pub fn new(dim: usize, metric: Metric, nlist: usize) -> Self {
        Self {
            dim,
            metric,
            nlist,
            nprobe: DEFAULT_NPROBE.min(nlist.max(1)),
            trained: false,
            centroids: Vec::new(),
            ids: Vec::new(),
            data: Vec::new(),
            slots: HashMap::new(),
            assignments: Vec::new(),
            lists: Vec::new(),
        }
    }

    pub(super) fn load(r: &mut impl Read, header: &IndexHeader) -> Result<Self> {
        let dim = header.dim as usize;

        let mut nlist_buf = [0u8; 4];
        r.read_exact(&mut nlist_buf)?;
        let nlist = u32::from_le_bytes(nlist_buf) as usize;

        let centroids = if header.trained {
            read_floats(r, nlist * dim)?
        } else {
            Vec::new()
        };

        let (ids, data) = super::ann::read_rows(r, header.count as usize, dim)?;

        let mut index = Self {
            dim,
            metric: header.metric,
            nlist,
            nprobe: DEFAULT_NPROBE.min(nlist.max(1)),
            trained: header.trained,
            centroids,
            ids,
            data,
            slots: HashMap::new(),
            assignments: Vec::new(),
            lists: vec![Vec::new(); if header.trained { nlist } else { 0 }],
        };

        // Rebuild slots and list membership from the persisted rows. Rows
        // only exist once the index is trained, so centroids are available.
        for row in 0..index.ids.len() {
            if !index.trained {
                return Err(DbError::invariant(
                    "index file holds rows but is marked untrained".to_string(),
                ));
            }
            index.slots.insert(index.ids[row], row);
            let list = index.nearest_centroid(index.row(row));
            index.assignments.push(list);
            index.lists[list].push(row);
        }

        Ok(index)
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    fn centroid(&self, list: usize) -> &[f32] {
        &self.centroids[list * self.dim..(list + 1) * self.dim]
    }

    /// Nearest centroid by squared L2, which is what training optimizes
    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for list in 0..self.nlist {
            let d = Metric::L2.distance(vector, self.centroid(list));
            if d < best_dist {
                best = list;
                best_dist = d;
            }
        }
        best
    }

    /// Lists to probe for `query`, nearest first
    fn probe_lists(&self, query: &[f32]) -> Vec<usize> {
        let mut ranked: Vec<(usize, f32)> = (0..self.nlist)
            .map(|list| (list, Metric::L2.distance(query, self.centroid(list))))
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.nprobe);
        ranked.into_iter().map(|(list, _)| list).collect()
    }

    fn remove_row(&mut self, row: usize) {
        let last = self.ids.len() - 1;
        self.slots.remove(&self.ids[row]);

        let list = self.assignments[row];
        self.lists[list].retain(|&r| r != row);

        if row != last {
            let moved_id = self.ids[last];
            let moved_list = self.assignments[last];
            for r in self.lists[moved_list].iter_mut() {
                if *r == last {
                    *r = row;
                }
            }
            self.slots.insert(moved_id, row);
            let (head, tail) = self.data.split_at_mut(last * self.dim);
            head[row * self.dim..(row + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
        }
        self.ids.swap_remove(row);
        self.assignments.swap_remove(row);
        self.data.truncate(last * self.dim);
    }

    fn push_row(&mut self, id: i64, vector: &[f32]) {
        let list = self.nearest_centroid(vector);
        let row = self.ids.len();
        self.slots.insert(id, row);
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        self.assignments.push(list);
        self.lists[list].push(row);
    }
}

impl AnnIndex for IvfIndex {
    fn is_trained(&self) -> bool {
        self.trained
    }

    fn train(&mut self, samples: &[f32]) -> Result<()> {
        let n = samples.len() / self.dim;
        if n < self.nlist {
            return Err(DbError::validation(format!(
                "training requires at least {} samples, got {n}",
                self.nlist
            )));
        }

        // Seed centroids at an even stride through the sample pool
        let stride = n / self.nlist;
        let mut centroids = Vec::with_capacity(self.nlist * self.dim);
        for c in 0..self.nlist {
            let row = c * stride;
            centroids.extend_from_slice(&samples[row * self.dim..(row + 1) * self.dim]);
        }
        self.centroids = centroids;

        // Lloyd iterations
        let mut sums = vec![0.0f64; self.nlist * self.dim];
        let mut counts = vec![0usize; self.nlist];
        for _ in 0..KMEANS_ITERATIONS {
            sums.iter_mut().for_each(|s| *s = 0.0);
            counts.iter_mut().for_each(|c| *c = 0);

            for row in 0..n {
                let vector = &samples[row * self.dim..(row + 1) * self.dim];
                let list = self.nearest_centroid(vector);
                counts[list] += 1;
                for (d, &v) in vector.iter().enumerate() {
                    sums[list * self.dim + d] += v as f64;
                }
            }

            for list in 0..self.nlist {
                // Empty cells keep their previous centroid
                if counts[list] == 0 {
                    continue;
                }
                for d in 0..self.dim {
                    self.centroids[list * self.dim + d] =
                        (sums[list * self.dim + d] / counts[list] as f64) as f32;
                }
            }
        }

        self.trained = true;
        self.lists = vec![Vec::new(); self.nlist];
        Ok(())
    }

    fn add_with_ids(&mut self, vectors: &[f32], ids: &[i64]) -> Result<()> {
        if !self.trained {
            return Err(DbError::validation("index is not trained"));
        }
        debug_assert_eq!(vectors.len(), ids.len() * self.dim);

        for (i, &id) in ids.iter().enumerate() {
            let vector = &vectors[i * self.dim..(i + 1) * self.dim];
            let existing = self.slots.get(&id).copied();
            if let Some(row) = existing {
                self.remove_row(row);
            }
            self.push_row(id, vector);
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
        if !self.trained || self.ids.is_empty() {
            return Ok(SearchHits::default());
        }

        let mut scored: Vec<(i64, f32)> = Vec::new();
        for list in self.probe_lists(query) {
            for &row in &self.lists[list] {
                scored.push((self.ids[row], self.metric.distance(query, self.row(row))));
            }
        }

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

        if self.trained {
            for list in self.probe_lists(query) {
                for &row in &self.lists[list] {
                    let d = self.metric.distance(query, self.row(row));
                    if d <= radius {
                        ids.push(self.ids[row]);
                        distances.push(d);
                    }
                }
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
                kind: KIND_IVF,
                metric: self.metric,
                trained: self.trained,
                dim: self.dim as u32,
                count: self.ids.len() as u64,
            }
            .write(w)?;
            w.write_all(&(self.nlist as u32).to_le_bytes())?;
            if self.trained {
                write_floats(w, &self.centroids)?;
            }
            write_rows(w, &self.ids, &self.data, self.dim)
        })
    }
}
