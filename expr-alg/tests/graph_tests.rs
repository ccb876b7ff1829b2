use expr_alg::{find_similar_pairs, ClusterParams, FindSimilarPairsArgs, GraphRegistry, SimilarityMode};
use expr_store::{ExpressionStore, StoreParams};
use tempfile::tempdir;

fn small_params() -> StoreParams {
    StoreParams {
        gene_capacity: 1024,
        cell_capacity: 1024,
        cell_meta_data_name_capacity: 128,
        cell_meta_data_value_capacity: 4096,
    }
}

/// Two well-separated expression programs of four cells each, plus one
/// silent cell that should end up isolated.
fn two_population_store(dir: &std::path::Path) -> anyhow::Result<ExpressionStore> {
    let mut store = ExpressionStore::create(dir.join("store"), &small_params())?;
    for i in 0..4u32 {
        let name = format!("alpha{i}");
        let scale = 1.0 + i as f32;
        store.add_cell(
            &[("CellName", &name)],
            &[
                ("G0", 10.0 * scale),
                ("G1", 20.0 * scale),
                ("G2", 30.0 * scale),
            ],
        )?;
    }
    for i in 0..4u32 {
        let name = format!("beta{i}");
        let scale = 1.0 + i as f32;
        store.add_cell(
            &[("CellName", &name)],
            &[
                ("G0", 30.0 * scale),
                ("G1", 20.0 * scale),
                ("G2", 10.0 * scale),
            ],
        )?;
    }
    store.add_cell(&[("CellName", "silent")], &[])?;
    Ok(store)
}

#[test]
fn graph_build_cluster_and_store_back() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = two_population_store(dir.path())?;

    assert!(find_similar_pairs(
        &store,
        &FindSimilarPairsArgs {
            name: "Pairs",
            gene_set_name: "AllGenes",
            cell_set_name: "AllCells",
            k: 8,
            similarity_threshold: 0.5,
            mode: SimilarityMode::Exact,
            cancel: None,
        },
    )?);

    let mut registry = GraphRegistry::new();
    assert!(registry.create_graph(&store, "Graph", "AllCells", "Pairs", 0.5, 8, None)?);
    // Name collision and missing inputs are reported, not errors.
    assert!(!registry.create_graph(&store, "Graph", "AllCells", "Pairs", 0.5, 8, None)?);
    assert!(!registry.create_graph(&store, "Other", "AllCells", "Nope", 0.5, 8, None)?);
    assert!(!registry.create_graph(&store, "Other", "Nope", "Pairs", 0.5, 8, None)?);

    {
        let (graph_info, _graph) = registry.get("Graph").unwrap();
        // The silent cell has no edges and is removed.
        assert_eq!(graph_info.isolated_vertex_count, 1);
        assert_eq!(graph_info.vertex_count, 8);
        // Each population is a 4-clique: 2 * (4 choose 2) edges.
        assert_eq!(graph_info.edge_count, 12);
    }

    let (_, graph) = registry.get_mut("Graph").unwrap();
    let stats = graph.cluster(&ClusterParams {
        seed: 5,
        ..Default::default()
    })?;
    assert!(stats.converged);
    assert_eq!(stats.cluster_count, 2);

    // Same-population vertices share a label, across populations differ.
    let label_of = |graph: &expr_alg::CellSimilarityGraph, cell_id: u32| {
        graph
            .vertices()
            .iter()
            .find(|v| v.cell_id == cell_id)
            .map(|v| v.cluster_id)
            .unwrap()
    };
    let alpha = label_of(graph, 0);
    let beta = label_of(graph, 4);
    assert_ne!(alpha, beta);
    for cell_id in 0..4 {
        assert_eq!(label_of(graph, cell_id), alpha);
    }
    for cell_id in 4..8 {
        assert_eq!(label_of(graph, cell_id), beta);
    }

    // A repeat clustering with the same seed is identical.
    let labels: Vec<u32> = graph.vertices().iter().map(|v| v.cluster_id).collect();
    let stats_again = graph.cluster(&ClusterParams {
        seed: 5,
        ..Default::default()
    })?;
    assert_eq!(stats_again.cluster_count, 2);
    let labels_again: Vec<u32> = graph.vertices().iter().map(|v| v.cluster_id).collect();
    assert_eq!(labels, labels_again);

    // Cluster ids land in cell meta data; the silent cell gets none.
    graph.store_cluster_ids(&mut store, "Cluster")?;
    let alpha_value = store.get_cell_meta_data(0, "Cluster").unwrap().to_string();
    for cell_id in 1..4 {
        assert_eq!(
            store.get_cell_meta_data(cell_id, "Cluster"),
            Some(alpha_value.as_str())
        );
    }
    assert_ne!(
        store.get_cell_meta_data(4, "Cluster"),
        Some(alpha_value.as_str())
    );
    assert_eq!(store.get_cell_meta_data(8, "Cluster"), None);
    Ok(())
}

#[test]
fn threshold_prunes_edges_at_graph_level() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = two_population_store(dir.path())?;

    // Store every finite pair, including the perfect anti-correlations
    // across populations, so the graph has something to re-filter.
    assert!(find_similar_pairs(
        &store,
        &FindSimilarPairsArgs {
            name: "Loose",
            gene_set_name: "AllGenes",
            cell_set_name: "AllCells",
            k: 8,
            similarity_threshold: -1.5,
            mode: SimilarityMode::Exact,
            cancel: None,
        },
    )?);

    let mut registry = GraphRegistry::new();
    assert!(registry.create_graph(&store, "Tight", "AllCells", "Loose", 0.9, 8, None)?);
    let (graph_info, _) = registry.get("Tight").unwrap();
    // Only the intra-population perfect correlations survive a 0.9
    // threshold.
    assert_eq!(graph_info.edge_count, 12);
    assert_eq!(graph_info.vertex_count, 8);

    assert!(registry.remove("Tight"));
    assert!(!registry.remove("Tight"));
    Ok(())
}
