//! The persistent expression store.
//!
//! All binary data for a store live in one directory of memory-mapped
//! files. A store is single-writer: mutation requires `&mut self`, and
//! read-only kernels may run in parallel between mutations.

use fnv::FnvHashMap;
use log::info;
use mmap_util::{MappedVector, StringTable, VectorOfVectors};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::cell_sets::CellSet;
use crate::error::StoreError;
use crate::gene_sets::GeneSet;
use crate::similarity;
use crate::types::{
    CellId, CellRecord, ExpressionEntry, GeneId, MetaDataPair, Normalization, StoreParams,
    StringId,
};

pub const ALL_GENES: &str = "AllGenes";
pub const ALL_CELLS: &str = "AllCells";

/// The meta-data name every cell must carry; its value is the cell name.
pub const CELL_NAME_FIELD: &str = "CellName";

pub struct ExpressionStore {
    pub(crate) dir: PathBuf,
    pub(crate) gene_names: StringTable,
    pub(crate) cells: MappedVector<CellRecord>,
    pub(crate) cell_names: StringTable,
    pub(crate) cell_meta_data: VectorOfVectors<MetaDataPair>,
    pub(crate) cell_meta_data_names: StringTable,
    pub(crate) cell_meta_data_values: StringTable,
    pub(crate) cell_meta_data_names_usage_count: MappedVector<u32>,
    pub(crate) cell_expression_counts: VectorOfVectors<ExpressionEntry>,
    pub(crate) gene_sets: FnvHashMap<String, GeneSet>,
    pub(crate) cell_sets: FnvHashMap<String, CellSet>,
}

impl ExpressionStore {
    /// Create a new store in `dir`. The directory must not exist; a failed
    /// create removes everything it wrote.
    pub fn create(dir: impl AsRef<Path>, params: &StoreParams) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            return Err(StoreError::AlreadyExists(format!(
                "store directory {}",
                dir.display()
            ))
            .into());
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Io(format!("cannot create {}: {e}", dir.display())))?;

        match Self::create_in(&dir, params) {
            Ok(store) => Ok(store),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    fn create_in(dir: &Path, params: &StoreParams) -> anyhow::Result<Self> {
        std::fs::create_dir(dir.join("CellSets"))
            .map_err(|e| StoreError::Io(format!("cannot create CellSets: {e}")))?;

        let gene_names = StringTable::create_new(dir.join("GeneNames"), params.gene_capacity)
            .map_err(StoreError::from)?;
        let cells =
            MappedVector::create_new(dir.join("Cells"), 0, 0).map_err(StoreError::from)?;
        let cell_names = StringTable::create_new(dir.join("CellNames"), params.cell_capacity)
            .map_err(StoreError::from)?;
        let cell_meta_data =
            VectorOfVectors::create_new(dir.join("CellMetaData")).map_err(StoreError::from)?;
        let cell_meta_data_names = StringTable::create_new(
            dir.join("CellMetaDataNames"),
            params.cell_meta_data_name_capacity,
        )
        .map_err(StoreError::from)?;
        let cell_meta_data_values = StringTable::create_new(
            dir.join("CellMetaDataValues"),
            params.cell_meta_data_value_capacity,
        )
        .map_err(StoreError::from)?;
        let cell_meta_data_names_usage_count =
            MappedVector::create_new(dir.join("CellMetaDataNamesUsageCount"), 0, 0)
                .map_err(StoreError::from)?;
        let cell_expression_counts = VectorOfVectors::create_new(dir.join("CellExpressionCounts"))
            .map_err(StoreError::from)?;

        let mut gene_sets = FnvHashMap::default();
        gene_sets.insert(
            ALL_GENES.to_string(),
            GeneSet::create(dir, ALL_GENES, &[])?,
        );
        let mut cell_sets = FnvHashMap::default();
        cell_sets.insert(
            ALL_CELLS.to_string(),
            CellSet::create(dir, ALL_CELLS, &[])?,
        );

        info!("created expression store in {}", dir.display());
        Ok(ExpressionStore {
            dir: dir.to_path_buf(),
            gene_names,
            cells,
            cell_names,
            cell_meta_data,
            cell_meta_data_names,
            cell_meta_data_values,
            cell_meta_data_names_usage_count,
            cell_expression_counts,
            gene_sets,
            cell_sets,
        })
    }

    /// Open a previously created store with read-write access.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(
                StoreError::NotFound(format!("store directory {}", dir.display())).into(),
            );
        }

        let gene_names =
            StringTable::open_existing(dir.join("GeneNames"), true).map_err(StoreError::from)?;
        let cells =
            MappedVector::open_existing(dir.join("Cells"), true).map_err(StoreError::from)?;
        let cell_names =
            StringTable::open_existing(dir.join("CellNames"), true).map_err(StoreError::from)?;
        let cell_meta_data = VectorOfVectors::open_existing(dir.join("CellMetaData"), true)
            .map_err(StoreError::from)?;
        let cell_meta_data_names = StringTable::open_existing(dir.join("CellMetaDataNames"), true)
            .map_err(StoreError::from)?;
        let cell_meta_data_values =
            StringTable::open_existing(dir.join("CellMetaDataValues"), true)
                .map_err(StoreError::from)?;
        let cell_meta_data_names_usage_count =
            MappedVector::open_existing(dir.join("CellMetaDataNamesUsageCount"), true)
                .map_err(StoreError::from)?;
        let cell_expression_counts =
            VectorOfVectors::open_existing(dir.join("CellExpressionCounts"), true)
                .map_err(StoreError::from)?;

        // Gene sets are discovered by a directory scan; the file name is
        // authoritative.
        let mut gene_sets = FnvHashMap::default();
        let pattern = Regex::new(r"^GeneSet-(.+)-GlobalIds$").expect("static pattern");
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| StoreError::Io(format!("cannot scan {}: {e}", dir.display())))?
        {
            let entry =
                entry.map_err(|e| StoreError::Io(format!("cannot scan store: {e}")))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(captures) = pattern.captures(file_name) {
                let set_name = captures[1].to_string();
                let set = GeneSet::open(&dir, &set_name)?;
                gene_sets.insert(set_name, set);
            }
        }

        let mut cell_sets = FnvHashMap::default();
        for entry in std::fs::read_dir(dir.join("CellSets"))
            .map_err(|e| StoreError::Io(format!("cannot scan CellSets: {e}")))?
        {
            let entry =
                entry.map_err(|e| StoreError::Io(format!("cannot scan CellSets: {e}")))?;
            let Some(set_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let set = CellSet::open(&dir, &set_name)?;
            cell_sets.insert(set_name, set);
        }

        let store = ExpressionStore {
            dir,
            gene_names,
            cells,
            cell_names,
            cell_meta_data,
            cell_meta_data_names,
            cell_meta_data_values,
            cell_meta_data_names_usage_count,
            cell_expression_counts,
            gene_sets,
            cell_sets,
        };
        store.check_consistency()?;
        info!(
            "opened expression store in {}: {} genes, {} cells",
            store.dir.display(),
            store.gene_count(),
            store.cell_count()
        );
        Ok(store)
    }

    fn check_consistency(&self) -> Result<(), StoreError> {
        let n = self.cells.len();
        let all_cells = self
            .cell_sets
            .get(ALL_CELLS)
            .ok_or_else(|| StoreError::Corrupt("cell set AllCells is missing".into()))?;
        let all_genes = self
            .gene_sets
            .get(ALL_GENES)
            .ok_or_else(|| StoreError::Corrupt("gene set AllGenes is missing".into()))?;

        if self.cell_names.len() != n
            || self.cell_meta_data.len() != n
            || self.cell_expression_counts.len() != n
            || all_cells.len() != n
        {
            return Err(StoreError::Corrupt(format!(
                "inconsistent cell table sizes: {} cells, {} names, {} meta rows, {} count rows, {} in AllCells",
                n,
                self.cell_names.len(),
                self.cell_meta_data.len(),
                self.cell_expression_counts.len(),
                all_cells.len()
            )));
        }
        if self.cell_meta_data_names_usage_count.len() != self.cell_meta_data_names.len() {
            return Err(StoreError::Corrupt(
                "meta-data name usage counts out of sync".into(),
            ));
        }
        if all_genes.len() != self.gene_count() as usize {
            return Err(StoreError::Corrupt(format!(
                "AllGenes has {} genes but {} names are interned",
                all_genes.len(),
                self.gene_count()
            )));
        }
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn gene_count(&self) -> GeneId {
        self.gene_names.len() as GeneId
    }

    pub fn cell_count(&self) -> CellId {
        self.cells.len() as CellId
    }

    /// Register a gene. Returns false if the gene already existed. Genes
    /// are also registered automatically by `add_cell`; calling this makes
    /// sure genes with zero counts on all cells are present too.
    pub fn add_gene(&mut self, gene_name: &str) -> anyhow::Result<bool> {
        if self.gene_names.get(gene_name).is_some() {
            return Ok(false);
        }
        let gene_id = self.gene_names.intern(gene_name).map_err(StoreError::from)?;
        // Gene ids are dense and increasing, so AllGenes stays sorted.
        self.gene_sets
            .get_mut(ALL_GENES)
            .expect("AllGenes exists")
            .push(gene_id)?;
        Ok(true)
    }

    /// Add a cell from its meta data and expression counts.
    ///
    /// The meta data must contain a `CellName` entry, which is stored as
    /// the first pair; the cell name must be new. Zero counts are dropped,
    /// negative or non-finite counts and duplicate genes are rejected.
    /// Returns the id assigned to the cell.
    pub fn add_cell(
        &mut self,
        meta_data: &[(&str, &str)],
        expression_counts: &[(&str, f32)],
    ) -> anyhow::Result<CellId> {
        let name_position = meta_data
            .iter()
            .position(|(name, _)| *name == CELL_NAME_FIELD)
            .ok_or_else(|| {
                StoreError::InvalidInput(format!(
                    "cell meta data has no {CELL_NAME_FIELD} entry"
                ))
            })?;
        let cell_name = meta_data[name_position].1;
        if self.cell_names.get(cell_name).is_some() {
            return Err(StoreError::InvalidInput(format!(
                "cell name {cell_name} already exists"
            ))
            .into());
        }

        // Validate and normalize the expression counts before mutating
        // anything beyond the gene registry.
        let mut entries: Vec<ExpressionEntry> = Vec::with_capacity(expression_counts.len());
        let mut sum1 = 0.0_f64;
        let mut sum2 = 0.0_f64;
        for &(gene_name, count) in expression_counts {
            if !count.is_finite() || count < 0.0 {
                return Err(StoreError::InvalidInput(format!(
                    "invalid expression count {count} for cell {cell_name} gene {gene_name}"
                ))
                .into());
            }
            self.add_gene(gene_name)?;
            if count == 0.0 {
                continue;
            }
            let gene_id = self.gene_names.get(gene_name).expect("gene was registered");
            entries.push(ExpressionEntry { gene_id, count });
            sum1 += count as f64;
            sum2 += count as f64 * count as f64;
        }
        entries.sort_by_key(|e| e.gene_id);
        for pair in entries.windows(2) {
            if pair[0].gene_id == pair[1].gene_id {
                return Err(StoreError::InvalidInput(format!(
                    "duplicate expression count for cell {} gene {}",
                    cell_name,
                    self.gene_names.string(pair[0].gene_id)
                ))
                .into());
            }
        }

        // Norms are computed before their inverses; counts are
        // non-negative so the L1 norm equals sum1.
        let norm2 = sum2.sqrt();
        let record = CellRecord {
            sum1,
            sum2,
            norm2,
            norm1_inverse: 1.0 / sum1,
            norm2_inverse: 1.0 / norm2,
        };

        let cell_id = self.cell_names.intern(cell_name).map_err(StoreError::from)?;
        assert_eq!(cell_id as usize, self.cells.len(), "cell ids are dense");

        // Store the meta data, CellName first.
        self.cell_meta_data.append_row().map_err(StoreError::from)?;
        let reordered = std::iter::once(&meta_data[name_position])
            .chain(meta_data[..name_position].iter())
            .chain(meta_data[name_position + 1..].iter());
        for &(name, value) in reordered {
            let name_id = self
                .cell_meta_data_names
                .intern(name)
                .map_err(StoreError::from)?;
            self.increment_meta_name_usage(name_id)?;
            let value_id = self
                .cell_meta_data_values
                .intern(value)
                .map_err(StoreError::from)?;
            self.cell_meta_data
                .append_to_last_row(MetaDataPair { name_id, value_id })
                .map_err(StoreError::from)?;
        }

        // Store the expression counts, sorted by gene id.
        self.cell_expression_counts
            .append_row()
            .map_err(StoreError::from)?;
        for entry in &entries {
            self.cell_expression_counts
                .append_to_last_row(*entry)
                .map_err(StoreError::from)?;
        }

        self.cells.push(record).map_err(StoreError::from)?;
        self.cell_sets
            .get_mut(ALL_CELLS)
            .expect("AllCells exists")
            .push(cell_id)?;

        debug_assert_eq!(self.cell_names.len(), self.cells.len());
        debug_assert_eq!(self.cell_meta_data.len(), self.cells.len());
        debug_assert_eq!(self.cell_expression_counts.len(), self.cells.len());
        Ok(cell_id)
    }

    fn increment_meta_name_usage(&mut self, name_id: StringId) -> Result<(), StoreError> {
        let n = self.cell_meta_data_names_usage_count.len();
        if (name_id as usize) < n {
            self.cell_meta_data_names_usage_count[name_id as usize] += 1;
        } else {
            assert_eq!(n, name_id as usize, "usage counts are dense");
            self.cell_meta_data_names_usage_count.push(1)?;
        }
        Ok(())
    }

    /// How many cells carry a meta-data name.
    pub fn meta_name_usage_count(&self, name: &str) -> u32 {
        self.cell_meta_data_names
            .get(name)
            .map(|id| self.cell_meta_data_names_usage_count[id as usize])
            .unwrap_or(0)
    }

    pub fn gene_name(&self, gene_id: GeneId) -> &str {
        self.gene_names.string(gene_id)
    }

    pub fn cell_name(&self, cell_id: CellId) -> &str {
        self.cell_names.string(cell_id)
    }

    /// Resolve a cell from a name or an integer id string.
    pub fn cell_id_from_string(&self, s: &str) -> Option<CellId> {
        if let Ok(cell_id) = s.parse::<CellId>() {
            if cell_id < self.cell_count() {
                return Some(cell_id);
            }
        }
        self.cell_names.get(s)
    }

    /// Resolve a gene from a name or an integer id string.
    pub fn gene_id_from_string(&self, s: &str) -> Option<GeneId> {
        if let Ok(gene_id) = s.parse::<GeneId>() {
            if gene_id < self.gene_count() {
                return Some(gene_id);
            }
        }
        self.gene_names.get(s)
    }

    /// The value of a meta-data field for a cell, if the cell has it.
    pub fn get_cell_meta_data(&self, cell_id: CellId, name: &str) -> Option<&str> {
        let name_id = self.cell_meta_data_names.get(name)?;
        self.cell_meta_data
            .row(cell_id as usize)
            .iter()
            .find(|pair| pair.name_id == name_id)
            .map(|pair| self.cell_meta_data_values.string(pair.value_id))
    }

    /// All (name, value) meta-data pairs for a cell, in stored order.
    pub fn get_all_cell_meta_data(&self, cell_id: CellId) -> Vec<(&str, &str)> {
        self.cell_meta_data
            .row(cell_id as usize)
            .iter()
            .map(|pair| {
                (
                    self.cell_meta_data_names.string(pair.name_id),
                    self.cell_meta_data_values.string(pair.value_id),
                )
            })
            .collect()
    }

    /// Set a meta-data (name, value) pair for a cell, replacing the value
    /// if the name is already present.
    pub fn set_cell_meta_data(
        &mut self,
        cell_id: CellId,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        assert!(cell_id < self.cell_count(), "cell id out of range");
        let name_id = self
            .cell_meta_data_names
            .intern(name)
            .map_err(StoreError::from)?;
        let value_id = self
            .cell_meta_data_values
            .intern(value)
            .map_err(StoreError::from)?;

        let row = self.cell_meta_data.row_mut(cell_id as usize);
        if let Some(pair) = row.iter_mut().find(|pair| pair.name_id == name_id) {
            pair.value_id = value_id;
            return Ok(());
        }

        let pair = MetaDataPair { name_id, value_id };
        if cell_id as usize + 1 == self.cell_meta_data.len() {
            self.cell_meta_data
                .append_to_last_row(pair)
                .map_err(StoreError::from)?;
        } else {
            // The jagged layout only appends to its last row; adding a new
            // field to an earlier cell rewrites the container.
            let mut rows: Vec<Vec<MetaDataPair>> = self
                .cell_meta_data
                .rows()
                .map(|row| row.to_vec())
                .collect();
            rows[cell_id as usize].push(pair);
            self.cell_meta_data
                .replace_all_rows(&rows)
                .map_err(StoreError::from)?;
        }
        self.increment_meta_name_usage(name_id)?;
        Ok(())
    }

    /// Set one meta-data name on many cells at once, rewriting the
    /// meta-data container at most once.
    pub fn set_cell_meta_data_bulk(
        &mut self,
        name: &str,
        assignments: &[(CellId, String)],
    ) -> anyhow::Result<()> {
        let name_id = self
            .cell_meta_data_names
            .intern(name)
            .map_err(StoreError::from)?;

        let mut rows: Vec<Vec<MetaDataPair>> = self
            .cell_meta_data
            .rows()
            .map(|row| row.to_vec())
            .collect();
        let mut appended = 0u32;
        for (cell_id, value) in assignments {
            assert!((*cell_id as usize) < rows.len(), "cell id out of range");
            let value_id = self
                .cell_meta_data_values
                .intern(value)
                .map_err(StoreError::from)?;
            let row = &mut rows[*cell_id as usize];
            if let Some(pair) = row.iter_mut().find(|pair| pair.name_id == name_id) {
                pair.value_id = value_id;
            } else {
                row.push(MetaDataPair { name_id, value_id });
                appended += 1;
            }
        }
        self.cell_meta_data
            .replace_all_rows(&rows)
            .map_err(StoreError::from)?;
        for _ in 0..appended {
            self.increment_meta_name_usage(name_id)?;
        }
        Ok(())
    }

    /// Histogram of a meta-data field over a set of cells, sorted by
    /// decreasing frequency, ties by value.
    pub fn histogram_meta_data(&self, cell_ids: &[CellId], name: &str) -> Vec<(String, usize)> {
        let Some(name_id) = self.cell_meta_data_names.get(name) else {
            return Vec::new();
        };
        let mut histogram: FnvHashMap<&str, usize> = FnvHashMap::default();
        for &cell_id in cell_ids {
            let value = self
                .cell_meta_data
                .row(cell_id as usize)
                .iter()
                .find(|pair| pair.name_id == name_id)
                .map(|pair| self.cell_meta_data_values.string(pair.value_id));
            if let Some(value) = value {
                *histogram.entry(value).or_default() += 1;
            }
        }
        let mut sorted: Vec<(String, usize)> = histogram
            .into_iter()
            .map(|(value, count)| (value.to_string(), count))
            .collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    /// The sparse expression row of a cell, sorted by gene id.
    pub fn expression_counts(&self, cell_id: CellId) -> &[ExpressionEntry] {
        self.cell_expression_counts.row(cell_id as usize)
    }

    /// The raw count for one (cell, gene), zero if not stored.
    pub fn expression_count(&self, cell_id: CellId, gene_id: GeneId) -> f32 {
        let row = self.expression_counts(cell_id);
        match row.binary_search_by_key(&gene_id, |e| e.gene_id) {
            Ok(i) => row[i].count,
            Err(_) => 0.0,
        }
    }

    pub fn cell_record(&self, cell_id: CellId) -> &CellRecord {
        &self.cells[cell_id as usize]
    }

    /// The expression vector of a cell restricted to a gene set, with
    /// local gene ids, normalized within the restriction.
    pub fn expression_vector(
        &self,
        cell_id: CellId,
        gene_set: &GeneSet,
        normalization: Normalization,
    ) -> Vec<ExpressionEntry> {
        let mut vector: Vec<ExpressionEntry> = self
            .expression_counts(cell_id)
            .iter()
            .filter_map(|e| {
                gene_set.local_id(e.gene_id).map(|local| ExpressionEntry {
                    gene_id: local,
                    count: e.count,
                })
            })
            .collect();

        let factor = match normalization {
            Normalization::None => return vector,
            Normalization::L1 => {
                let sum: f64 = vector.iter().map(|e| e.count as f64).sum();
                1.0 / sum
            }
            Normalization::L2 => {
                let sum: f64 = vector
                    .iter()
                    .map(|e| e.count as f64 * e.count as f64)
                    .sum();
                1.0 / sum.sqrt()
            }
        };
        for e in &mut vector {
            e.count = (e.count as f64 * factor) as f32;
        }
        vector
    }

    /// Average normalized expression over a list of cells, one value per
    /// gene of the gene set.
    pub fn average_expression(
        &self,
        gene_set: &GeneSet,
        cell_ids: &[CellId],
        normalization: Normalization,
    ) -> Vec<f64> {
        let mut average = vec![0.0_f64; gene_set.len()];
        for &cell_id in cell_ids {
            for e in self.expression_vector(cell_id, gene_set, normalization) {
                average[e.gene_id as usize] += e.count as f64;
            }
        }
        if !cell_ids.is_empty() {
            let factor = 1.0 / cell_ids.len() as f64;
            for a in &mut average {
                *a *= factor;
            }
        }
        match normalization {
            Normalization::None => {}
            Normalization::L1 => {
                let sum: f64 = average.iter().sum();
                if sum > 0.0 {
                    for a in &mut average {
                        *a /= sum;
                    }
                }
            }
            Normalization::L2 => {
                let sum: f64 = average.iter().map(|a| a * a).sum();
                if sum > 0.0 {
                    let factor = 1.0 / sum.sqrt();
                    for a in &mut average {
                        *a *= factor;
                    }
                }
            }
        }
        average
    }

    /// Exact similarity of two cells: the Pearson correlation of their
    /// expression counts over all genes.
    pub fn cell_similarity(&self, cell_a: CellId, cell_b: CellId) -> f64 {
        let dot = similarity::sparse_dot(
            self.expression_counts(cell_a),
            self.expression_counts(cell_b),
        );
        let a = self.cell_record(cell_a);
        let b = self.cell_record(cell_b);
        similarity::pearson(self.gene_count() as f64, dot, a.sum1, a.sum2, b.sum1, b.sum2)
    }

    /// Force all mapped data out to disk.
    pub fn sync_to_disk(&self) -> anyhow::Result<()> {
        self.gene_names.sync_to_disk().map_err(StoreError::from)?;
        self.cells.sync_to_disk().map_err(StoreError::from)?;
        self.cell_names.sync_to_disk().map_err(StoreError::from)?;
        self.cell_meta_data.sync_to_disk().map_err(StoreError::from)?;
        self.cell_meta_data_names
            .sync_to_disk()
            .map_err(StoreError::from)?;
        self.cell_meta_data_values
            .sync_to_disk()
            .map_err(StoreError::from)?;
        self.cell_meta_data_names_usage_count
            .sync_to_disk()
            .map_err(StoreError::from)?;
        self.cell_expression_counts
            .sync_to_disk()
            .map_err(StoreError::from)?;
        for set in self.gene_sets.values() {
            set.sync_to_disk()?;
        }
        for set in self.cell_sets.values() {
            set.sync_to_disk()?;
        }
        Ok(())
    }

    /// Sync and unmap everything.
    pub fn close(self) -> anyhow::Result<()> {
        self.sync_to_disk()
    }
}
