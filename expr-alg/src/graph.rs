//! The cell-similarity graph: undirected, weighted, in memory only.
//!
//! Vertices carry a cell id and a cluster id; edges carry the stored
//! similarity. Clustering is label propagation with a seeded visit
//! permutation.

use fnv::FnvHashMap;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand_mt::Mt;

use expr_store::{CancelToken, CellId, CellSet, ExpressionStore, StoreError};

use crate::similar_pairs::SimilarPairs;

/// Label assigned to vertices of clusters collapsed for being smaller
/// than the configured minimum.
pub const UNCLUSTERED_LABEL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
pub struct Vertex {
    pub cell_id: CellId,
    pub cluster_id: u32,
}

pub struct CellSimilarityGraph {
    vertices: Vec<Vertex>,
    adjacency: Vec<Vec<(u32, f32)>>,
    edge_count: usize,
}

/// Construction record kept alongside a graph in the registry.
#[derive(Clone, Debug)]
pub struct GraphInfo {
    pub cell_set_name: String,
    pub similar_pairs_name: String,
    pub similarity_threshold: f64,
    pub max_connectivity: usize,
    pub isolated_vertex_count: usize,
    pub vertex_count: usize,
    pub edge_count: usize,
}

#[derive(Clone, Debug)]
pub struct ClusterParams {
    pub max_iterations: usize,
    /// Clusters smaller than this collapse to `UNCLUSTERED_LABEL`.
    pub min_cluster_size: usize,
    pub seed: u32,
    pub cancel: Option<CancelToken>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            max_iterations: 100,
            min_cluster_size: 0,
            seed: 0,
            cancel: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClusterStats {
    pub iterations: usize,
    pub converged: bool,
    pub cluster_count: usize,
    pub unclustered_vertex_count: usize,
}

impl CellSimilarityGraph {
    /// Build the graph for a cell set from a SimilarPairs object: an edge
    /// exists when either endpoint's stored list, filtered by the
    /// similarity threshold and capped at `max_connectivity` entries,
    /// contains the pair.
    pub fn new(
        cell_set: &CellSet,
        similar_pairs: &SimilarPairs,
        similarity_threshold: f64,
        max_connectivity: usize,
        cancel: Option<&CancelToken>,
    ) -> anyhow::Result<Self> {
        let cell_ids = cell_set.ids();
        let vertices: Vec<Vertex> = cell_ids
            .iter()
            .map(|&cell_id| Vertex {
                cell_id,
                cluster_id: 0,
            })
            .collect();

        // Stored lists are sorted by decreasing similarity, so the k-NN
        // cap is a prefix truncation.
        let mut edges: FnvHashMap<(u32, u32), f32> = FnvHashMap::default();
        for (vertex, &cell_id) in cell_ids.iter().enumerate() {
            if vertex % 4096 == 0 && cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(StoreError::Cancelled.into());
            }
            let Some(local) = similar_pairs.local_cell_id(cell_id) else {
                continue;
            };
            for entry in similar_pairs
                .pairs(local)
                .iter()
                .take(max_connectivity)
                .filter(|e| e.similarity as f64 >= similarity_threshold)
            {
                let Ok(neighbor_vertex) = cell_ids.binary_search(&entry.cell_id) else {
                    continue;
                };
                let a = vertex as u32;
                let b = neighbor_vertex as u32;
                if a == b {
                    continue;
                }
                let key = if a < b { (a, b) } else { (b, a) };
                edges.entry(key).or_insert(entry.similarity);
            }
        }

        let mut adjacency: Vec<Vec<(u32, f32)>> = vec![Vec::new(); vertices.len()];
        for (&(a, b), &weight) in &edges {
            adjacency[a as usize].push((b, weight));
            adjacency[b as usize].push((a, weight));
        }
        for neighbors in &mut adjacency {
            neighbors.sort_by_key(|&(v, _)| v);
        }

        info!(
            "cell similarity graph: {} vertices, {} edges",
            vertices.len(),
            edges.len()
        );
        Ok(CellSimilarityGraph {
            vertices,
            adjacency,
            edge_count: edges.len(),
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn vertex(&self, v: usize) -> &Vertex {
        &self.vertices[v]
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn neighbors(&self, v: usize) -> &[(u32, f32)] {
        &self.adjacency[v]
    }

    /// Remove vertices with no edges, compacting the vertex table.
    /// Returns the number removed.
    pub fn remove_isolated_vertices(&mut self) -> usize {
        let keep: Vec<bool> = self.adjacency.iter().map(|n| !n.is_empty()).collect();
        let removed = keep.iter().filter(|&&k| !k).count();
        if removed == 0 {
            return 0;
        }

        let mut new_index = vec![u32::MAX; self.vertices.len()];
        let mut next = 0u32;
        for (v, &k) in keep.iter().enumerate() {
            if k {
                new_index[v] = next;
                next += 1;
            }
        }

        let mut vertices = Vec::with_capacity(next as usize);
        let mut adjacency = Vec::with_capacity(next as usize);
        for (v, &k) in keep.iter().enumerate() {
            if !k {
                continue;
            }
            vertices.push(self.vertices[v]);
            adjacency.push(
                self.adjacency[v]
                    .iter()
                    .map(|&(n, w)| (new_index[n as usize], w))
                    .collect(),
            );
        }
        self.vertices = vertices;
        self.adjacency = adjacency;
        info!("removed {removed} isolated vertices");
        removed
    }

    /// Label propagation: every vertex starts in its own cluster; each
    /// iteration visits the vertices in a seeded random permutation and
    /// adopts the label with the largest edge-weight sum among neighbors,
    /// ties to the lowest label. Stops when an iteration changes nothing.
    pub fn cluster(&mut self, params: &ClusterParams) -> anyhow::Result<ClusterStats> {
        let n = self.vertices.len();
        let mut labels: Vec<u32> = (0..n as u32).collect();
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = Mt::new(params.seed);

        let mut iterations = 0;
        let mut converged = false;
        while iterations < params.max_iterations {
            if params
                .cancel
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
            {
                return Err(StoreError::Cancelled.into());
            }
            iterations += 1;
            order.shuffle(&mut rng);

            let mut changed = 0usize;
            let mut weights: FnvHashMap<u32, f64> = FnvHashMap::default();
            for &v in &order {
                if self.adjacency[v].is_empty() {
                    continue;
                }
                weights.clear();
                for &(neighbor, weight) in &self.adjacency[v] {
                    *weights.entry(labels[neighbor as usize]).or_default() += weight as f64;
                }
                let mut best_label = labels[v];
                let mut best_weight = f64::NEG_INFINITY;
                for (&label, &weight) in weights.iter() {
                    if weight > best_weight || (weight == best_weight && label < best_label) {
                        best_label = label;
                        best_weight = weight;
                    }
                }
                if best_label != labels[v] {
                    labels[v] = best_label;
                    changed += 1;
                }
            }
            if changed == 0 {
                converged = true;
                break;
            }
        }

        // Collapse clusters below the minimum size.
        let mut sizes: FnvHashMap<u32, usize> = FnvHashMap::default();
        for &label in &labels {
            *sizes.entry(label).or_default() += 1;
        }
        let mut unclustered = 0;
        if params.min_cluster_size > 1 {
            for label in &mut labels {
                if sizes[label] < params.min_cluster_size {
                    *label = UNCLUSTERED_LABEL;
                    unclustered += 1;
                }
            }
        }
        let cluster_count = labels
            .iter()
            .filter(|&&l| l != UNCLUSTERED_LABEL)
            .collect::<fnv::FnvHashSet<_>>()
            .len();

        for (vertex, &label) in self.vertices.iter_mut().zip(&labels) {
            vertex.cluster_id = label;
        }

        info!(
            "label propagation: {iterations} iterations, {cluster_count} clusters, \
             {unclustered} unclustered vertices, converged = {converged}"
        );
        Ok(ClusterStats {
            iterations,
            converged,
            cluster_count,
            unclustered_vertex_count: unclustered,
        })
    }

    /// Store every vertex's cluster id as cell meta data under the given
    /// name, replacing existing values.
    pub fn store_cluster_ids(
        &self,
        store: &mut ExpressionStore,
        meta_data_name: &str,
    ) -> anyhow::Result<()> {
        let assignments: Vec<(CellId, String)> = self
            .vertices
            .iter()
            .map(|v| (v.cell_id, v.cluster_id.to_string()))
            .collect();
        store.set_cell_meta_data_bulk(meta_data_name, &assignments)
    }
}

/// Owns the named graphs of a process; external references are by name.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: FnvHashMap<String, (GraphInfo, CellSimilarityGraph)>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a SimilarPairs object and register it under
    /// `graph_name`. Returns false if the name is taken or an input is
    /// missing.
    pub fn create_graph(
        &mut self,
        store: &ExpressionStore,
        graph_name: &str,
        cell_set_name: &str,
        similar_pairs_name: &str,
        similarity_threshold: f64,
        max_connectivity: usize,
        cancel: Option<&CancelToken>,
    ) -> anyhow::Result<bool> {
        if self.graphs.contains_key(graph_name) {
            warn!("graph {graph_name} already exists");
            return Ok(false);
        }
        let Some(cell_set) = store.cell_set(cell_set_name) else {
            warn!("cell set {cell_set_name} does not exist");
            return Ok(false);
        };
        let similar_pairs = match SimilarPairs::open(store.directory(), similar_pairs_name) {
            Ok(similar_pairs) => similar_pairs,
            Err(e) => {
                warn!("similar pairs {similar_pairs_name} cannot be opened: {e}");
                return Ok(false);
            }
        };
        if crate::similar_pairs::gene_set_names_matching(store, &similar_pairs).is_empty() {
            warn!(
                "similar pairs {similar_pairs_name} is orphaned: no current gene set matches \
                 its recorded gene set"
            );
        }

        let mut graph = CellSimilarityGraph::new(
            cell_set,
            &similar_pairs,
            similarity_threshold,
            max_connectivity,
            cancel,
        )?;
        let isolated_vertex_count = graph.remove_isolated_vertices();
        let graph_info = GraphInfo {
            cell_set_name: cell_set_name.to_string(),
            similar_pairs_name: similar_pairs_name.to_string(),
            similarity_threshold,
            max_connectivity,
            isolated_vertex_count,
            vertex_count: graph.vertex_count(),
            edge_count: graph.edge_count(),
        };
        self.graphs
            .insert(graph_name.to_string(), (graph_info, graph));
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<&(GraphInfo, CellSimilarityGraph)> {
        self.graphs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (GraphInfo, CellSimilarityGraph)> {
        self.graphs.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.graphs.remove(name).is_none() {
            warn!("graph {name} does not exist");
            return false;
        }
        true
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
