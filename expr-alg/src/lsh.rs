//! Locality-sensitive hashing over gene space.
//!
//! Each signature bit is the sign of the cell's centered projection onto a
//! random unit hyperplane. The Hamming distance between two signatures
//! estimates the angle between the centered expression vectors, and the
//! cosine of that angle equals their Pearson correlation.

use indicatif::ParallelProgressIterator;
use log::info;
use mmap_util::bitset::{set_bit_in_row, SignatureArena};
use rand::Rng;
use rand_distr::StandardNormal;
use rand_mt::Mt;
use rayon::prelude::*;
use std::f64::consts::PI;

use expr_store::{CancelToken, ExpressionSubset, StoreError};

pub struct LshModel {
    bit_count: usize,
    /// Hyperplane components, gene-major: component of plane `j` for local
    /// gene `g` is `plane_components[g * bit_count + j]`.
    plane_components: Vec<f64>,
    /// Per-plane component sums, for the centering correction.
    plane_sums: Vec<f64>,
    signatures: SignatureArena,
}

impl LshModel {
    /// Draw the hyperplanes and compute all cell signatures. Bit-for-bit
    /// deterministic given the subset, bit count, and seed.
    pub fn new(
        subset: &ExpressionSubset,
        bit_count: usize,
        seed: u32,
        cancel: Option<&CancelToken>,
    ) -> anyhow::Result<Self> {
        assert!(bit_count > 0, "lsh bit count must be positive");
        let gene_count = subset.gene_count();

        info!("generating {bit_count} lsh hyperplanes over {gene_count} genes");
        let (plane_components, plane_sums) = generate_planes(gene_count, bit_count, seed);

        info!(
            "computing lsh signatures for {} cells",
            subset.cell_count()
        );
        let signatures = compute_signatures(
            subset,
            bit_count,
            &plane_components,
            &plane_sums,
            cancel,
        )?;

        Ok(LshModel {
            bit_count,
            plane_components,
            plane_sums,
            signatures,
        })
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn signatures(&self) -> &SignatureArena {
        &self.signatures
    }

    /// The packed signature words of one local cell.
    pub fn signature_words(&self, local_cell_id: usize) -> &[u64] {
        self.signatures.row(local_cell_id)
    }

    /// Estimated Pearson correlation of two local cells from their
    /// signature Hamming distance: cos(pi * h / L), in [-1, 1].
    pub fn similarity(&self, local_a: usize, local_b: usize) -> f64 {
        let mismatches = self.signatures.count_mismatches(local_a, local_b);
        (PI * mismatches as f64 / self.bit_count as f64).cos()
    }

    /// The component of plane `j` for a local gene.
    pub fn plane_component(&self, local_gene_id: usize, plane: usize) -> f64 {
        self.plane_components[local_gene_id * self.bit_count + plane]
    }

    pub fn plane_sum(&self, plane: usize) -> f64 {
        self.plane_sums[plane]
    }
}

/// Draw the hyperplane components gene-major with fresh standard-normal
/// draws, then normalize every plane to unit L2 norm.
fn generate_planes(gene_count: usize, bit_count: usize, seed: u32) -> (Vec<f64>, Vec<f64>) {
    let mut rng = Mt::new(seed);
    let mut components = vec![0.0_f64; gene_count * bit_count];
    let mut squared_norms = vec![0.0_f64; bit_count];

    for gene in 0..gene_count {
        for plane in 0..bit_count {
            let x: f64 = rng.sample(StandardNormal);
            components[gene * bit_count + plane] = x;
            squared_norms[plane] += x * x;
        }
    }

    let factors: Vec<f64> = squared_norms
        .iter()
        .map(|&n| if n > 0.0 { 1.0 / n.sqrt() } else { 0.0 })
        .collect();
    let mut plane_sums = vec![0.0_f64; bit_count];
    for gene in 0..gene_count {
        for plane in 0..bit_count {
            let c = &mut components[gene * bit_count + plane];
            *c *= factors[plane];
            plane_sums[plane] += *c;
        }
    }
    (components, plane_sums)
}

fn compute_signatures(
    subset: &ExpressionSubset,
    bit_count: usize,
    plane_components: &[f64],
    plane_sums: &[f64],
    cancel: Option<&CancelToken>,
) -> Result<SignatureArena, StoreError> {
    let cell_count = subset.cell_count();
    let gene_count = subset.gene_count();
    let mut arena = SignatureArena::new(cell_count, bit_count);
    let words_per_set = arena.words_per_set();

    arena
        .as_mut_words()
        .par_chunks_mut(words_per_set)
        .enumerate()
        .progress_count(cell_count as u64)
        .try_for_each(|(local_cell_id, row)| -> Result<(), StoreError> {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(StoreError::Cancelled);
            }

            // The centered scalar product with plane U is
            // x . U - mean * sum(U); start from the correction and add the
            // sparse x . U part.
            let mean = subset.sums(local_cell_id).sum1 / gene_count as f64;
            let mut scalar_products: Vec<f64> =
                plane_sums.iter().map(|&s| -mean * s).collect();
            for e in subset.counts(local_cell_id) {
                let components =
                    &plane_components[e.gene_id as usize * bit_count..][..bit_count];
                let count = e.count as f64;
                for (s, c) in scalar_products.iter_mut().zip(components) {
                    *s += count * c;
                }
            }

            for (plane, &s) in scalar_products.iter().enumerate() {
                if s > 0.0 {
                    set_bit_in_row(row, plane);
                }
            }
            Ok(())
        })?;

    Ok(arena)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planes_are_unit_norm_and_deterministic() {
        let (components, sums) = generate_planes(50, 8, 42);
        let (again, _) = generate_planes(50, 8, 42);
        assert_eq!(components, again);
        let (other, _) = generate_planes(50, 8, 43);
        assert_ne!(components, other);

        for plane in 0..8 {
            let norm: f64 = (0..50)
                .map(|g| components[g * 8 + plane].powi(2))
                .sum();
            assert!((norm - 1.0).abs() < 1e-12);
            let sum: f64 = (0..50).map(|g| components[g * 8 + plane]).sum();
            assert!((sum - sums[plane]).abs() < 1e-12);
        }
    }
}
