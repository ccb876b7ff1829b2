//! Shannon information content of genes over a cell set.
//!
//! Computed one gene at a time so memory stays proportional to the cell
//! set, not to genes x cells.

use indicatif::ParallelProgressIterator;
use rayon::prelude::*;

use crate::gene_sets::GeneSet;
use crate::store::ExpressionStore;
use crate::types::{CellId, GeneId, Normalization};

/// Information content in bits for every gene of the gene set, in set
/// order. Normalization is whole-cell, via the precomputed inverse norms.
pub fn compute_gene_information_content(
    store: &ExpressionStore,
    gene_set: &GeneSet,
    cell_ids: &[CellId],
    normalization: Normalization,
) -> Vec<f64> {
    gene_set
        .ids()
        .par_iter()
        .progress_count(gene_set.len() as u64)
        .map(|&gene_id| gene_information_content(store, gene_id, cell_ids, normalization))
        .collect()
}

fn gene_information_content(
    store: &ExpressionStore,
    gene_id: GeneId,
    cell_ids: &[CellId],
    normalization: Normalization,
) -> f64 {
    let mut counts = Vec::with_capacity(cell_ids.len());
    for &cell_id in cell_ids {
        let raw = store.expression_count(cell_id, gene_id);
        if raw <= 0.0 {
            counts.push(0.0_f64);
            continue;
        }
        let record = store.cell_record(cell_id);
        let normalized = match normalization {
            Normalization::None => raw as f64,
            Normalization::L1 => raw as f64 * record.norm1_inverse,
            Normalization::L2 => raw as f64 * record.norm2_inverse,
        };
        counts.push(normalized);
    }

    let sum: f64 = counts.iter().sum();
    // Equally distributed expression would carry log |C| of information.
    let mut information = (cell_ids.len() as f64).ln();
    if sum > 0.0 {
        let inverse_sum = 1.0 / sum;
        for &c in &counts {
            if c > 0.0 {
                let p = c * inverse_sum;
                information += p * p.ln();
            }
        }
    }
    information / std::f64::consts::LN_2
}
