use bytemuck::{Pod, Zeroable};

/// Dense global gene identifier. Equals the id interned for the gene name.
pub type GeneId = u32;

/// Dense global cell identifier. Equals the id interned for the cell name.
pub type CellId = u32;

/// Dense identifier into a string table.
pub type StringId = u32;

pub const INVALID_GENE_ID: GeneId = u32::MAX;
pub const INVALID_CELL_ID: CellId = u32::MAX;

/// Fixed-size per-cell record. Sums are over the cell's raw expression
/// counts; norms are computed before their inverses.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CellRecord {
    pub sum1: f64,
    pub sum2: f64,
    pub norm2: f64,
    pub norm1_inverse: f64,
    pub norm2_inverse: f64,
}

/// One cell meta-data (name, value) pair, both interned.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MetaDataPair {
    pub name_id: StringId,
    pub value_id: StringId,
}

/// One non-zero expression count. Within a cell, entries are sorted by
/// `gene_id` and gene ids are unique.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ExpressionEntry {
    pub gene_id: GeneId,
    pub count: f32,
}

/// Whole-cell normalization applied to expression counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Normalization {
    None,
    L1,
    L2,
}

/// Capacities fixed at store creation. The string tables use open
/// addressing without rehash, so these are hard limits; size them at
/// least twice the expected number of entries.
#[derive(Clone, Debug)]
pub struct StoreParams {
    /// Maximum number of distinct genes.
    pub gene_capacity: usize,
    /// Maximum number of distinct cells.
    pub cell_capacity: usize,
    /// Maximum number of distinct meta-data name strings.
    pub cell_meta_data_name_capacity: usize,
    /// Maximum number of distinct meta-data value strings.
    pub cell_meta_data_value_capacity: usize,
}

impl Default for StoreParams {
    fn default() -> Self {
        StoreParams {
            gene_capacity: 1 << 18,
            cell_capacity: 1 << 24,
            cell_meta_data_name_capacity: 1 << 16,
            cell_meta_data_value_capacity: 1 << 28,
        }
    }
}
