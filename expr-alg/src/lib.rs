pub mod graph; // cell-similarity graph and label propagation
pub mod lsh; // random-hyperplane signatures
pub mod similar_pairs; // persisted per-cell top-k neighbor index

pub use graph::{
    CellSimilarityGraph, ClusterParams, ClusterStats, GraphInfo, GraphRegistry,
    UNCLUSTERED_LABEL,
};
pub use lsh::LshModel;
pub use similar_pairs::{
    find_similar_pairs, remove_similar_pairs, CellSimilarity, FindSimilarPairsArgs,
    SimilarPairs, SimilarityMode,
};
