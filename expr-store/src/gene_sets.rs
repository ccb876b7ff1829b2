//! Named gene sets over global gene ids, stored sorted ascending.
//!
//! A gene set defines local ids: the local id of a gene is its position in
//! the sorted list. Sets are persisted one file each and discovered at
//! store open by a directory scan.

use log::{info, warn};
use mmap_util::MappedVector;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::info_content::compute_gene_information_content;
use crate::store::{ExpressionStore, ALL_GENES};
use crate::types::{GeneId, Normalization};

pub struct GeneSet {
    ids: MappedVector<GeneId>,
}

fn gene_set_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("GeneSet-{name}-GlobalIds"))
}

impl GeneSet {
    pub(crate) fn create(dir: &Path, name: &str, ids: &[GeneId]) -> Result<Self, StoreError> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "gene sets are sorted");
        let path = gene_set_path(dir, name);
        let mut vector = match MappedVector::create_new(&path, ids.len(), ids.len()) {
            Ok(vector) => vector,
            Err(e) => {
                // A failed create leaves no partial file behind.
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        vector.as_mut_slice().copy_from_slice(ids);
        Ok(GeneSet { ids: vector })
    }

    pub(crate) fn open(dir: &Path, name: &str) -> Result<Self, StoreError> {
        let ids = MappedVector::open_existing(gene_set_path(dir, name), true)?;
        if !ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(StoreError::Corrupt(format!(
                "gene set {name} is not strictly ascending"
            )));
        }
        Ok(GeneSet { ids })
    }

    pub(crate) fn push(&mut self, gene_id: GeneId) -> Result<(), StoreError> {
        debug_assert!(self.ids.last().map_or(true, |&last| last < gene_id));
        self.ids.push(gene_id)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The global gene ids, ascending.
    pub fn ids(&self) -> &[GeneId] {
        self.ids.as_slice()
    }

    /// The local id of a global gene, if the gene is in the set.
    pub fn local_id(&self, global_id: GeneId) -> Option<GeneId> {
        self.ids
            .binary_search(&global_id)
            .ok()
            .map(|local| local as GeneId)
    }

    pub fn global_id(&self, local_id: GeneId) -> GeneId {
        self.ids[local_id as usize]
    }

    pub fn contains(&self, global_id: GeneId) -> bool {
        self.ids.binary_search(&global_id).is_ok()
    }

    pub fn sync_to_disk(&self) -> Result<(), StoreError> {
        self.ids.sync_to_disk()?;
        Ok(())
    }

    fn remove(self) -> Result<(), StoreError> {
        self.ids.remove()?;
        Ok(())
    }
}

/// Counts reported by gene-set creation from an explicit name list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneNameSelection {
    /// Names that did not match any registered gene.
    pub ignored_count: usize,
    /// Empty name strings.
    pub empty_count: usize,
}

/// Compile a pattern with whole-string match semantics.
pub(crate) fn full_match_regex(pattern: &str) -> Result<Regex, StoreError> {
    Regex::new(&format!(r"\A(?:{pattern})\z")).map_err(|e| {
        StoreError::InvalidInput(format!("malformed regular expression {pattern}: {e}"))
    })
}

pub(crate) fn union_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if b[j] < a[i] {
            out.push(b[j]);
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub(crate) fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            i += 1;
        } else if b[j] < a[i] {
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out
}

pub(crate) fn difference_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() {
        if j == b.len() || a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if b[j] < a[i] {
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    out
}

pub(crate) fn validate_set_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(std::path::MAIN_SEPARATOR) {
        return Err(StoreError::InvalidInput(format!(
            "invalid set name {name:?}"
        )));
    }
    Ok(())
}

impl ExpressionStore {
    pub fn gene_set(&self, name: &str) -> Option<&GeneSet> {
        self.gene_sets.get(name)
    }

    pub fn gene_set_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gene_sets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn store_gene_set(&mut self, name: &str, ids: Vec<GeneId>) -> anyhow::Result<()> {
        let set = GeneSet::create(&self.dir, name, &ids)?;
        info!("gene set {name} contains {} genes", set.len());
        self.gene_sets.insert(name.to_string(), set);
        Ok(())
    }

    /// Create a gene set of the genes whose name fully matches a regular
    /// expression. Returns false if the set name is taken.
    pub fn create_gene_set_from_regex(
        &mut self,
        set_name: &str,
        pattern: &str,
    ) -> anyhow::Result<bool> {
        validate_set_name(set_name)?;
        if self.gene_sets.contains_key(set_name) {
            warn!("gene set {set_name} already exists");
            return Ok(false);
        }
        let regex = full_match_regex(pattern)?;
        let ids: Vec<GeneId> = (0..self.gene_count())
            .filter(|&gene_id| regex.is_match(self.gene_names.string(gene_id)))
            .collect();
        self.store_gene_set(set_name, ids)?;
        Ok(true)
    }

    /// Create a gene set from an explicit list of gene names. Unknown
    /// names are ignored and empty names skipped; both are counted in the
    /// returned selection. Returns None if the set name is taken.
    pub fn create_gene_set_from_gene_names(
        &mut self,
        set_name: &str,
        gene_names: &[&str],
    ) -> anyhow::Result<Option<GeneNameSelection>> {
        validate_set_name(set_name)?;
        if self.gene_sets.contains_key(set_name) {
            warn!("gene set {set_name} already exists");
            return Ok(None);
        }
        let mut selection = GeneNameSelection::default();
        let mut ids = Vec::new();
        for name in gene_names {
            if name.is_empty() {
                selection.empty_count += 1;
                continue;
            }
            match self.gene_names.get(name) {
                Some(gene_id) => ids.push(gene_id),
                None => selection.ignored_count += 1,
            }
        }
        ids.sort_unstable();
        ids.dedup();
        self.store_gene_set(set_name, ids)?;
        Ok(Some(selection))
    }

    pub fn create_gene_set_union(
        &mut self,
        input_names: &[&str],
        output_name: &str,
    ) -> anyhow::Result<bool> {
        self.create_gene_set_merge(input_names, output_name, true)
    }

    pub fn create_gene_set_intersection(
        &mut self,
        input_names: &[&str],
        output_name: &str,
    ) -> anyhow::Result<bool> {
        self.create_gene_set_merge(input_names, output_name, false)
    }

    fn create_gene_set_merge(
        &mut self,
        input_names: &[&str],
        output_name: &str,
        union: bool,
    ) -> anyhow::Result<bool> {
        validate_set_name(output_name)?;
        if input_names.len() < 2 {
            return Err(StoreError::InvalidInput(
                "gene set union/intersection needs at least two input sets".into(),
            )
            .into());
        }
        if self.gene_sets.contains_key(output_name) {
            warn!("gene set {output_name} already exists");
            return Ok(false);
        }
        for name in input_names {
            if !self.gene_sets.contains_key(*name) {
                warn!("gene set {name} does not exist");
                return Ok(false);
            }
        }

        let mut ids: Vec<GeneId> = self.gene_sets[input_names[0]].ids().to_vec();
        for name in &input_names[1..] {
            let other = self.gene_sets[*name].ids();
            ids = if union {
                union_sorted(&ids, other)
            } else {
                intersect_sorted(&ids, other)
            };
        }
        self.store_gene_set(output_name, ids)?;
        Ok(true)
    }

    pub fn create_gene_set_difference(
        &mut self,
        input_name_a: &str,
        input_name_b: &str,
        output_name: &str,
    ) -> anyhow::Result<bool> {
        validate_set_name(output_name)?;
        if self.gene_sets.contains_key(output_name) {
            warn!("gene set {output_name} already exists");
            return Ok(false);
        }
        for name in [input_name_a, input_name_b] {
            if !self.gene_sets.contains_key(name) {
                warn!("gene set {name} does not exist");
                return Ok(false);
            }
        }
        let ids = difference_sorted(
            self.gene_sets[input_name_a].ids(),
            self.gene_sets[input_name_b].ids(),
        );
        self.store_gene_set(output_name, ids)?;
        Ok(true)
    }

    /// Create a gene set of the genes of an existing set whose information
    /// content over a cell set exceeds a threshold in bits.
    pub fn create_gene_set_using_information_content(
        &mut self,
        gene_set_name: &str,
        cell_set_name: &str,
        normalization: Normalization,
        threshold_bits: f64,
        new_set_name: &str,
    ) -> anyhow::Result<bool> {
        validate_set_name(new_set_name)?;
        if self.gene_sets.contains_key(new_set_name) {
            warn!("gene set {new_set_name} already exists");
            return Ok(false);
        }
        let Some(gene_set) = self.gene_sets.get(gene_set_name) else {
            warn!("gene set {gene_set_name} does not exist");
            return Ok(false);
        };
        let Some(cell_set) = self.cell_sets.get(cell_set_name) else {
            warn!("cell set {cell_set_name} does not exist");
            return Ok(false);
        };

        let information =
            compute_gene_information_content(self, gene_set, cell_set.ids(), normalization);
        let ids: Vec<GeneId> = gene_set
            .ids()
            .iter()
            .zip(&information)
            .filter(|(_, &bits)| bits > threshold_bits)
            .map(|(&gene_id, _)| gene_id)
            .collect();
        self.store_gene_set(new_set_name, ids)?;
        Ok(true)
    }

    /// Remove a named gene set and its backing file. Returns false if the
    /// set does not exist. `AllGenes` cannot be removed.
    pub fn remove_gene_set(&mut self, name: &str) -> anyhow::Result<bool> {
        if name == ALL_GENES {
            return Err(
                StoreError::InvalidInput(format!("gene set {ALL_GENES} cannot be removed")).into(),
            );
        }
        match self.gene_sets.remove(name) {
            Some(set) => {
                set.remove()?;
                Ok(true)
            }
            None => {
                warn!("gene set {name} does not exist");
                Ok(false)
            }
        }
    }
}
