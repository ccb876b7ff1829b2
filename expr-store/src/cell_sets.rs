//! Named cell sets over global cell ids, stored sorted ascending.

use log::{info, warn};
use mmap_util::MappedVector;
use rand::Rng;
use rand_mt::Mt;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::gene_sets::{
    difference_sorted, full_match_regex, intersect_sorted, union_sorted, validate_set_name,
};
use crate::store::{ExpressionStore, ALL_CELLS};
use crate::types::CellId;

pub struct CellSet {
    ids: MappedVector<CellId>,
}

fn cell_set_path(dir: &Path, name: &str) -> PathBuf {
    dir.join("CellSets").join(name)
}

impl CellSet {
    pub(crate) fn create(dir: &Path, name: &str, ids: &[CellId]) -> Result<Self, StoreError> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "cell sets are sorted");
        let path = cell_set_path(dir, name);
        let mut vector = match MappedVector::create_new(&path, ids.len(), ids.len()) {
            Ok(vector) => vector,
            Err(e) => {
                // A failed create leaves no partial file behind.
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        vector.as_mut_slice().copy_from_slice(ids);
        Ok(CellSet { ids: vector })
    }

    pub(crate) fn open(dir: &Path, name: &str) -> Result<Self, StoreError> {
        let ids = MappedVector::open_existing(cell_set_path(dir, name), true)?;
        if !ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(StoreError::Corrupt(format!(
                "cell set {name} is not strictly ascending"
            )));
        }
        Ok(CellSet { ids })
    }

    pub(crate) fn push(&mut self, cell_id: CellId) -> Result<(), StoreError> {
        debug_assert!(self.ids.last().map_or(true, |&last| last < cell_id));
        self.ids.push(cell_id)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The global cell ids, ascending.
    pub fn ids(&self) -> &[CellId] {
        self.ids.as_slice()
    }

    pub fn contains(&self, cell_id: CellId) -> bool {
        self.ids.binary_search(&cell_id).is_ok()
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

impl ExpressionStore {
    pub fn cell_set(&self, name: &str) -> Option<&CellSet> {
        self.cell_sets.get(name)
    }

    pub fn cell_set_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.cell_sets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn store_cell_set(&mut self, name: &str, ids: Vec<CellId>) -> anyhow::Result<()> {
        let set = CellSet::create(&self.dir, name, &ids)?;
        info!("cell set {name} contains {} cells", set.len());
        self.cell_sets.insert(name.to_string(), set);
        Ok(())
    }

    /// Create a cell set of the cells whose value for a meta-data field
    /// fully matches a regular expression. Returns false if the set name
    /// is taken.
    pub fn create_cell_set_using_meta_data(
        &mut self,
        set_name: &str,
        meta_data_name: &str,
        pattern: &str,
    ) -> anyhow::Result<bool> {
        validate_set_name(set_name)?;
        if self.cell_sets.contains_key(set_name) {
            warn!("cell set {set_name} already exists");
            return Ok(false);
        }
        let regex = full_match_regex(pattern)?;

        let mut ids = Vec::new();
        if let Some(name_id) = self.cell_meta_data_names.get(meta_data_name) {
            for cell_id in 0..self.cell_count() {
                let matched = self
                    .cell_meta_data
                    .row(cell_id as usize)
                    .iter()
                    .any(|pair| {
                        pair.name_id == name_id
                            && regex.is_match(self.cell_meta_data_values.string(pair.value_id))
                    });
                if matched {
                    ids.push(cell_id);
                }
            }
        }
        self.store_cell_set(set_name, ids)?;
        Ok(true)
    }

    pub fn create_cell_set_union(
        &mut self,
        input_names: &[&str],
        output_name: &str,
    ) -> anyhow::Result<bool> {
        self.create_cell_set_merge(input_names, output_name, true)
    }

    pub fn create_cell_set_intersection(
        &mut self,
        input_names: &[&str],
        output_name: &str,
    ) -> anyhow::Result<bool> {
        self.create_cell_set_merge(input_names, output_name, false)
    }

    fn create_cell_set_merge(
        &mut self,
        input_names: &[&str],
        output_name: &str,
        union: bool,
    ) -> anyhow::Result<bool> {
        validate_set_name(output_name)?;
        if input_names.len() < 2 {
            return Err(StoreError::InvalidInput(
                "cell set union/intersection needs at least two input sets".into(),
            )
            .into());
        }
        if self.cell_sets.contains_key(output_name) {
            warn!("cell set {output_name} already exists");
            return Ok(false);
        }
        for name in input_names {
            if !self.cell_sets.contains_key(*name) {
                warn!("cell set {name} does not exist");
                return Ok(false);
            }
        }

        let mut ids: Vec<CellId> = self.cell_sets[input_names[0]].ids().to_vec();
        for name in &input_names[1..] {
            let other = self.cell_sets[*name].ids();
            ids = if union {
                union_sorted(&ids, other)
            } else {
                intersect_sorted(&ids, other)
            };
        }
        self.store_cell_set(output_name, ids)?;
        Ok(true)
    }

    pub fn create_cell_set_difference(
        &mut self,
        input_name_a: &str,
        input_name_b: &str,
        output_name: &str,
    ) -> anyhow::Result<bool> {
        validate_set_name(output_name)?;
        if self.cell_sets.contains_key(output_name) {
            warn!("cell set {output_name} already exists");
            return Ok(false);
        }
        for name in [input_name_a, input_name_b] {
            if !self.cell_sets.contains_key(name) {
                warn!("cell set {name} does not exist");
                return Ok(false);
            }
        }
        let ids = difference_sorted(
            self.cell_sets[input_name_a].ids(),
            self.cell_sets[input_name_b].ids(),
        );
        self.store_cell_set(output_name, ids)?;
        Ok(true)
    }

    /// Create a cell set by keeping each cell of an input set independently
    /// with the given probability. Iteration is in ascending cell id on a
    /// Mersenne-Twister stream, so the result is reproducible from the
    /// seed.
    pub fn downsample_cell_set(
        &mut self,
        input_name: &str,
        output_name: &str,
        probability: f64,
        seed: u32,
    ) -> anyhow::Result<bool> {
        validate_set_name(output_name)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(StoreError::InvalidInput(format!(
                "down-sampling probability {probability} is outside [0, 1]"
            ))
            .into());
        }
        if self.cell_sets.contains_key(output_name) {
            warn!("cell set {output_name} already exists");
            return Ok(false);
        }
        let Some(input) = self.cell_sets.get(input_name) else {
            warn!("cell set {input_name} does not exist");
            return Ok(false);
        };

        let mut rng = Mt::new(seed);
        let ids: Vec<CellId> = input
            .ids()
            .iter()
            .filter(|_| rng.gen::<f64>() < probability)
            .copied()
            .collect();
        self.store_cell_set(output_name, ids)?;
        Ok(true)
    }

    /// Remove a named cell set and its backing file. Returns false if the
    /// set does not exist. `AllCells` cannot be removed.
    pub fn remove_cell_set(&mut self, name: &str) -> anyhow::Result<bool> {
        if name == ALL_CELLS {
            return Err(
                StoreError::InvalidInput(format!("cell set {ALL_CELLS} cannot be removed")).into(),
            );
        }
        match self.cell_sets.remove(name) {
            Some(set) => {
                set.remove()?;
                Ok(true)
            }
            None => {
                warn!("cell set {name} does not exist");
                Ok(false)
            }
        }
    }
}

