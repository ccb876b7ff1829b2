//! A (gene set, cell set) projection of the expression store.
//!
//! Numeric kernels see dense local ids: local gene id = position in the
//! gene set, local cell id = position in the cell set. Per-cell sums are
//! restricted to the gene set.

use log::info;
use rayon::prelude::*;

use crate::cell_sets::CellSet;
use crate::gene_sets::GeneSet;
use crate::similarity;
use crate::store::ExpressionStore;
use crate::types::{CellId, ExpressionEntry};

/// Per-cell sums over the genes of the subset.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubsetSums {
    pub sum1: f64,
    pub sum2: f64,
}

pub struct ExpressionSubset {
    gene_global_ids: Vec<u32>,
    cell_global_ids: Vec<CellId>,
    offsets: Vec<u64>,
    entries: Vec<ExpressionEntry>,
    sums: Vec<SubsetSums>,
}

impl ExpressionSubset {
    /// Project the store onto a gene set and a cell set, reindexing the
    /// expression counts to local gene ids.
    pub fn new(store: &ExpressionStore, gene_set: &GeneSet, cell_set: &CellSet) -> Self {
        let cell_global_ids = cell_set.ids().to_vec();

        let rows: Vec<Vec<ExpressionEntry>> = cell_global_ids
            .par_iter()
            .map(|&cell_id| {
                store
                    .expression_counts(cell_id)
                    .iter()
                    .filter_map(|e| {
                        gene_set.local_id(e.gene_id).map(|local| ExpressionEntry {
                            gene_id: local,
                            count: e.count,
                        })
                    })
                    .collect()
            })
            .collect();

        let mut offsets = Vec::with_capacity(rows.len() + 1);
        offsets.push(0u64);
        let mut entries = Vec::new();
        let mut sums = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cell_sums = SubsetSums::default();
            for e in row {
                cell_sums.sum1 += e.count as f64;
                cell_sums.sum2 += e.count as f64 * e.count as f64;
            }
            sums.push(cell_sums);
            entries.extend_from_slice(row);
            offsets.push(entries.len() as u64);
        }

        info!(
            "expression subset: {} genes x {} cells, {} non-zero entries",
            gene_set.len(),
            cell_global_ids.len(),
            entries.len()
        );
        ExpressionSubset {
            gene_global_ids: gene_set.ids().to_vec(),
            cell_global_ids,
            offsets,
            entries,
            sums,
        }
    }

    pub fn gene_count(&self) -> usize {
        self.gene_global_ids.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cell_global_ids.len()
    }

    /// The expression entries of a local cell, local gene ids ascending.
    pub fn counts(&self, local_cell_id: usize) -> &[ExpressionEntry] {
        let begin = self.offsets[local_cell_id] as usize;
        let end = self.offsets[local_cell_id + 1] as usize;
        &self.entries[begin..end]
    }

    pub fn sums(&self, local_cell_id: usize) -> SubsetSums {
        self.sums[local_cell_id]
    }

    pub fn global_cell_id(&self, local_cell_id: usize) -> CellId {
        self.cell_global_ids[local_cell_id]
    }

    pub fn cell_ids(&self) -> &[CellId] {
        &self.cell_global_ids
    }

    pub fn gene_ids(&self) -> &[u32] {
        &self.gene_global_ids
    }

    /// Exact similarity of two local cells: the Pearson correlation of
    /// their counts over the genes of the subset.
    pub fn cell_similarity(&self, local_a: usize, local_b: usize) -> f64 {
        let dot = similarity::sparse_dot(self.counts(local_a), self.counts(local_b));
        let a = self.sums[local_a];
        let b = self.sums[local_b];
        similarity::pearson(self.gene_count() as f64, dot, a.sum1, a.sum2, b.sum1, b.sum2)
    }
}
