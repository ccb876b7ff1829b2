pub mod cancel; // cooperative cancellation for long kernels
pub mod cell_sets; // named cell sets and their algebra
pub mod error; // store error kinds
pub mod gene_sets; // named gene sets and their algebra
pub mod info_content; // entropy-based gene filtering
pub mod similarity; // exact sparse Pearson correlation
pub mod store; // the persistent expression store
pub mod subset; // (gene set, cell set) projections with local ids
pub mod types; // identifiers, records, parameters

pub use cancel::CancelToken;
pub use cell_sets::CellSet;
pub use error::StoreError;
pub use gene_sets::GeneSet;
pub use store::ExpressionStore;
pub use subset::ExpressionSubset;
pub use types::{
    CellId, CellRecord, ExpressionEntry, GeneId, MetaDataPair, Normalization, StoreParams,
    StringId, INVALID_CELL_ID, INVALID_GENE_ID,
};
