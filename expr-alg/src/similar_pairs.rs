//! The SimilarPairs index: for every cell of a cell set, its top-k most
//! similar cells over a gene set, persisted with a copy of both sets.
//!
//! The `Info` file is written last and doubles as the completion sentinel:
//! an object without a readable `Info` is removed wholesale on open.

use bytemuck::{Pod, Zeroable};
use indicatif::ParallelProgressIterator;
use log::{info, warn};
use mmap_util::{MappedVector, VectorOfVectors};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use expr_store::{
    CancelToken, CellId, ExpressionStore, ExpressionSubset, GeneSet, StoreError,
};

use crate::lsh::LshModel;

/// One stored neighbor of a cell.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CellSimilarity {
    pub cell_id: CellId,
    pub similarity: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SimilarPairsInfo {
    k: u64,
    threshold: f64,
    cell_count: u64,
    gene_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimilarityMode {
    /// All-pairs exact Pearson correlation.
    Exact,
    /// Random-hyperplane signatures and Hamming-derived correlation.
    Lsh { bit_count: usize, seed: u32 },
}

pub struct FindSimilarPairsArgs<'a> {
    pub name: &'a str,
    pub gene_set_name: &'a str,
    pub cell_set_name: &'a str,
    /// Maximum number of neighbors stored per cell.
    pub k: usize,
    /// Minimum similarity for a pair to be stored.
    pub similarity_threshold: f64,
    pub mode: SimilarityMode,
    pub cancel: Option<CancelToken>,
}

fn file_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("SimilarPairs-{name}{suffix}"))
}

fn remove_files(dir: &Path, name: &str) {
    for suffix in [
        "-Info",
        "-Pairs.toc",
        "-Pairs.data",
        "-GeneSet",
        "-CellSet",
    ] {
        let _ = std::fs::remove_file(file_path(dir, name, suffix));
    }
}

/// Remove a SimilarPairs object and all its files. Returns false if no
/// such object exists.
pub fn remove_similar_pairs(dir: &Path, name: &str) -> bool {
    if !file_path(dir, name, "-Info").exists() && !file_path(dir, name, "-Pairs.toc").exists() {
        warn!("similar pairs {name} does not exist");
        return false;
    }
    remove_files(dir, name);
    true
}

/// Build and persist a SimilarPairs object. Returns false if the name is
/// taken or an input set is missing.
pub fn find_similar_pairs(
    store: &ExpressionStore,
    args: &FindSimilarPairsArgs<'_>,
) -> anyhow::Result<bool> {
    let dir = store.directory();
    if file_path(dir, args.name, "-Info").exists() {
        warn!("similar pairs {} already exists", args.name);
        return Ok(false);
    }
    let Some(gene_set) = store.gene_set(args.gene_set_name) else {
        warn!("gene set {} does not exist", args.gene_set_name);
        return Ok(false);
    };
    let Some(cell_set) = store.cell_set(args.cell_set_name) else {
        warn!("cell set {} does not exist", args.cell_set_name);
        return Ok(false);
    };

    let subset = ExpressionSubset::new(store, gene_set, cell_set);
    match build_and_persist(dir, args, &subset) {
        Ok(()) => Ok(true),
        Err(e) => {
            // A failed or cancelled build leaves no partial artifact.
            remove_files(dir, args.name);
            Err(e.into())
        }
    }
}

fn build_and_persist(
    dir: &Path,
    args: &FindSimilarPairsArgs<'_>,
    subset: &ExpressionSubset,
) -> Result<(), StoreError> {
    let cell_count = subset.cell_count();
    let cancel = args.cancel.as_ref();

    let lists: Vec<Vec<CellSimilarity>> = match args.mode {
        SimilarityMode::Exact => {
            info!(
                "finding similar pairs {} by exact all-pairs scan over {} cells",
                args.name, cell_count
            );
            scan_all_pairs(subset, args, cancel, |a, b| subset.cell_similarity(a, b))?
        }
        SimilarityMode::Lsh { bit_count, seed } => {
            info!(
                "finding similar pairs {} by lsh over {} cells, {} bits, seed {}",
                args.name, cell_count, bit_count, seed
            );
            let model = LshModel::new(subset, bit_count, seed, cancel).map_err(|e| {
                e.downcast::<StoreError>()
                    .unwrap_or_else(|other| StoreError::Io(other.to_string()))
            })?;
            scan_all_pairs(subset, args, cancel, |a, b| model.similarity(a, b))?
        }
    };

    let stored: usize = lists.iter().map(Vec::len).sum();
    info!(
        "similar pairs {}: {} stored pairs for {} cells",
        args.name, stored, cell_count
    );

    // Persist: pairs, then the set copies, then the Info sentinel.
    let mut pairs = VectorOfVectors::<CellSimilarity>::create_new(file_path(
        dir,
        args.name,
        "-Pairs",
    ))?;
    pairs.begin_pass1(cell_count);
    for (local_cell_id, list) in lists.iter().enumerate() {
        pairs.increment_count(local_cell_id, list.len() as u64);
    }
    pairs.begin_pass2()?;
    for (local_cell_id, list) in lists.iter().enumerate() {
        for entry in list.iter().rev() {
            pairs.store(local_cell_id, *entry);
        }
    }
    pairs.end_pass2();
    pairs.close()?;

    let mut gene_copy =
        MappedVector::<u32>::create_new(file_path(dir, args.name, "-GeneSet"), 0, 0)?;
    for &gene_id in subset.gene_ids() {
        gene_copy.push(gene_id)?;
    }
    gene_copy.close()?;

    let mut cell_copy =
        MappedVector::<CellId>::create_new(file_path(dir, args.name, "-CellSet"), 0, 0)?;
    for &cell_id in subset.cell_ids() {
        cell_copy.push(cell_id)?;
    }
    cell_copy.close()?;

    let mut info_vector =
        MappedVector::<SimilarPairsInfo>::create_new(file_path(dir, args.name, "-Info"), 0, 1)?;
    info_vector.push(SimilarPairsInfo {
        k: args.k as u64,
        threshold: args.similarity_threshold,
        cell_count: cell_count as u64,
        gene_count: subset.gene_count() as u64,
    })?;
    info_vector.close()?;
    Ok(())
}

/// Scan, for every cell, all other cells of the subset, keeping the top-k
/// by decreasing similarity with ties broken by ascending cell id.
fn scan_all_pairs<F>(
    subset: &ExpressionSubset,
    args: &FindSimilarPairsArgs<'_>,
    cancel: Option<&CancelToken>,
    similarity: F,
) -> Result<Vec<Vec<CellSimilarity>>, StoreError>
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    let cell_count = subset.cell_count();
    (0..cell_count)
        .into_par_iter()
        .progress_count(cell_count as u64)
        .map(|local_a| -> Result<Vec<CellSimilarity>, StoreError> {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(StoreError::Cancelled);
            }
            let mut best: Vec<CellSimilarity> = Vec::with_capacity(args.k + 1);
            for local_b in 0..cell_count {
                if local_b == local_a {
                    continue;
                }
                let sim = similarity(local_a, local_b);
                if !sim.is_finite() || sim <= args.similarity_threshold {
                    continue;
                }
                insert_bounded(
                    &mut best,
                    args.k,
                    CellSimilarity {
                        cell_id: subset.global_cell_id(local_b),
                        similarity: sim as f32,
                    },
                );
            }
            Ok(best)
        })
        .collect()
}

/// Insert into a list kept sorted by decreasing similarity, ties by
/// ascending cell id, capped at `k` entries.
fn insert_bounded(list: &mut Vec<CellSimilarity>, k: usize, candidate: CellSimilarity) {
    if k == 0 {
        return;
    }
    let position = list.partition_point(|stored| {
        stored.similarity > candidate.similarity
            || (stored.similarity == candidate.similarity && stored.cell_id < candidate.cell_id)
    });
    if position >= k {
        return;
    }
    list.insert(position, candidate);
    list.truncate(k);
}

/// A previously built SimilarPairs object.
pub struct SimilarPairs {
    info: SimilarPairsInfo,
    pairs: VectorOfVectors<CellSimilarity>,
    gene_ids: MappedVector<u32>,
    cell_ids: MappedVector<CellId>,
}

impl SimilarPairs {
    /// Open an existing object. An object whose completion sentinel is
    /// missing or unreadable is removed wholesale.
    pub fn open(dir: &Path, name: &str) -> anyhow::Result<Self> {
        let info_path = file_path(dir, name, "-Info");
        if !info_path.exists() {
            if file_path(dir, name, "-Pairs.toc").exists() {
                // Leftovers of an interrupted build.
                remove_files(dir, name);
                return Err(StoreError::Corrupt(format!(
                    "similar pairs {name} has no completion sentinel; removed"
                ))
                .into());
            }
            return Err(StoreError::NotFound(format!("similar pairs {name}")).into());
        }
        let info_vector = match MappedVector::<SimilarPairsInfo>::open_existing(&info_path, false)
        {
            Ok(v) if v.len() == 1 => v,
            _ => {
                remove_files(dir, name);
                return Err(StoreError::Corrupt(format!(
                    "similar pairs {name} has an unreadable sentinel; removed"
                ))
                .into());
            }
        };
        let info = info_vector[0];

        let pairs = VectorOfVectors::open_existing(file_path(dir, name, "-Pairs"), false)
            .map_err(StoreError::from)?;
        let gene_ids = MappedVector::open_existing(file_path(dir, name, "-GeneSet"), false)
            .map_err(StoreError::from)?;
        let cell_ids = MappedVector::open_existing(file_path(dir, name, "-CellSet"), false)
            .map_err(StoreError::from)?;
        if pairs.len() != info.cell_count as usize || cell_ids.len() != info.cell_count as usize {
            return Err(StoreError::Corrupt(format!(
                "similar pairs {name} is inconsistent with its sentinel"
            ))
            .into());
        }
        Ok(SimilarPairs {
            info,
            pairs,
            gene_ids,
            cell_ids,
        })
    }

    pub fn k(&self) -> usize {
        self.info.k as usize
    }

    pub fn threshold(&self) -> f64 {
        self.info.threshold
    }

    pub fn cell_count(&self) -> usize {
        self.info.cell_count as usize
    }

    /// The stored neighbors of a local cell, decreasing similarity.
    pub fn pairs(&self, local_cell_id: usize) -> &[CellSimilarity] {
        self.pairs.row(local_cell_id)
    }

    /// The frozen cell set, ascending global ids.
    pub fn cell_ids(&self) -> &[CellId] {
        self.cell_ids.as_slice()
    }

    /// The recorded originating gene set, ascending global ids.
    pub fn gene_ids(&self) -> &[u32] {
        self.gene_ids.as_slice()
    }

    pub fn local_cell_id(&self, global_cell_id: CellId) -> Option<usize> {
        self.cell_ids.binary_search(&global_cell_id).ok()
    }

    /// Whether the recorded gene set equals a given one; consumers use
    /// this to validate reuse.
    pub fn matches_gene_set(&self, gene_set: &GeneSet) -> bool {
        self.gene_ids.as_slice() == gene_set.ids()
    }
}

/// The names of the store's gene sets identical to the recorded gene set
/// of a SimilarPairs object; empty means the object is orphaned.
pub fn gene_set_names_matching<'a>(
    store: &'a ExpressionStore,
    similar_pairs: &SimilarPairs,
) -> Vec<&'a str> {
    store
        .gene_set_names()
        .into_iter()
        .filter(|name| {
            store
                .gene_set(name)
                .is_some_and(|set| similar_pairs.matches_gene_set(set))
        })
        .collect()
}
