use approx::assert_abs_diff_eq;
use expr_store::{ExpressionStore, Normalization, StoreError, StoreParams};
use tempfile::tempdir;

fn small_params() -> StoreParams {
    StoreParams {
        gene_capacity: 1024,
        cell_capacity: 1024,
        cell_meta_data_name_capacity: 128,
        cell_meta_data_value_capacity: 4096,
    }
}

#[test]
fn create_rejects_existing_directory() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store");
    let store = ExpressionStore::create(&path, &small_params())?;
    store.close()?;

    let err = ExpressionStore::create(&path, &small_params())
        .err()
        .expect("create over an existing directory must fail");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyExists(_))
    ));
    Ok(())
}

#[test]
fn add_cell_validates_input() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    // Missing CellName.
    let err = store
        .add_cell(&[("Tissue", "brain")], &[("G0", 1.0)])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidInput(_))
    ));

    store.add_cell(&[("CellName", "c0")], &[("G0", 1.0)])?;

    // Duplicate cell name.
    let err = store
        .add_cell(&[("CellName", "c0")], &[("G0", 1.0)])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidInput(_))
    ));

    // Negative count.
    let err = store
        .add_cell(&[("CellName", "c1")], &[("G0", -1.0)])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidInput(_))
    ));

    // Duplicate gene within one cell.
    let err = store
        .add_cell(&[("CellName", "c2")], &[("G0", 1.0), ("G0", 2.0)])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidInput(_))
    ));
    Ok(())
}

#[test]
fn cell_name_is_promoted_and_zero_counts_dropped() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    let cell = store.add_cell(
        &[("Tissue", "liver"), ("CellName", "c0"), ("Day", "3")],
        &[("G2", 2.0), ("G0", 0.0), ("G1", 1.0)],
    )?;
    assert_eq!(cell, 0);

    let meta = store.get_all_cell_meta_data(cell);
    assert_eq!(meta[0], ("CellName", "c0"));
    assert_eq!(meta.len(), 3);

    // G0 was registered even though its count was dropped.
    assert!(store.gene_id_from_string("G0").is_some());
    let counts = store.expression_counts(cell);
    assert_eq!(counts.len(), 2);
    assert!(counts.windows(2).all(|w| w[0].gene_id < w[1].gene_id));
    assert!(counts.iter().all(|e| e.count > 0.0));
    Ok(())
}

#[test]
fn sums_match_recomputation() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    let counts: Vec<(String, f32)> = (0..40)
        .map(|i| (format!("G{i}"), 0.1 + 0.37 * i as f32))
        .collect();
    let count_refs: Vec<(&str, f32)> = counts.iter().map(|(n, c)| (n.as_str(), *c)).collect();
    let cell = store.add_cell(&[("CellName", "c0")], &count_refs)?;

    let record = store.cell_record(cell);
    let mut sum1 = 0.0_f64;
    let mut sum2 = 0.0_f64;
    for e in store.expression_counts(cell) {
        sum1 += e.count as f64;
        sum2 += e.count as f64 * e.count as f64;
    }
    assert_abs_diff_eq!(record.sum1, sum1);
    assert_abs_diff_eq!(record.sum2, sum2);
    assert_abs_diff_eq!(record.norm2, sum2.sqrt());
    assert_abs_diff_eq!(record.norm1_inverse, 1.0 / sum1);
    assert_abs_diff_eq!(record.norm2_inverse, 1.0 / sum2.sqrt());
    Ok(())
}

#[test]
fn roundtrip_reproduces_everything() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store");

    let (gene_count, cell_count, counts_before, meta_before) = {
        let mut store = ExpressionStore::create(&path, &small_params())?;
        store.add_gene("SILENT")?;
        for i in 0..20u32 {
            let name = format!("cell{i}");
            let gene_a = format!("G{}", i % 5);
            let gene_b = format!("G{}", (i + 1) % 5);
            store.add_cell(
                &[("CellName", &name), ("Batch", if i % 2 == 0 { "a" } else { "b" })],
                &[(&gene_a, 1.0 + i as f32), (&gene_b, 2.0)],
            )?;
        }
        let counts: Vec<Vec<_>> = (0..20)
            .map(|c| store.expression_counts(c).to_vec())
            .collect();
        let meta: Vec<Vec<(String, String)>> = (0..20)
            .map(|c| {
                store
                    .get_all_cell_meta_data(c)
                    .into_iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect()
            })
            .collect();
        let result = (store.gene_count(), store.cell_count(), counts, meta);
        store.close()?;
        result
    };

    let store = ExpressionStore::open(&path)?;
    assert_eq!(store.gene_count(), gene_count);
    assert_eq!(store.cell_count(), cell_count);
    assert_eq!(store.gene_set("AllGenes").unwrap().len(), gene_count as usize);
    assert_eq!(store.cell_set("AllCells").unwrap().len(), cell_count as usize);

    // Interned ids and per-cell data come back bitwise.
    assert_eq!(store.gene_id_from_string("SILENT"), Some(0));
    for i in 0..20u32 {
        assert_eq!(store.cell_id_from_string(&format!("cell{i}")), Some(i));
        assert_eq!(store.expression_counts(i), counts_before[i as usize]);
        let meta: Vec<(String, String)> = store
            .get_all_cell_meta_data(i)
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        assert_eq!(meta, meta_before[i as usize]);
    }
    Ok(())
}

#[test]
fn meta_data_set_overwrites_and_appends() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    for i in 0..3 {
        let name = format!("c{i}");
        store.add_cell(&[("CellName", &name)], &[("G0", 1.0)])?;
    }

    // Overwrite in place.
    store.set_cell_meta_data(1, "Cluster", "7")?;
    store.set_cell_meta_data(1, "Cluster", "9")?;
    assert_eq!(store.get_cell_meta_data(1, "Cluster"), Some("9"));
    assert_eq!(store.meta_name_usage_count("Cluster"), 1);

    // Appending to a cell that is not the last rewrites the container.
    store.set_cell_meta_data(0, "Cluster", "2")?;
    assert_eq!(store.get_cell_meta_data(0, "Cluster"), Some("2"));
    assert_eq!(store.get_cell_meta_data(1, "Cluster"), Some("9"));
    assert_eq!(store.get_cell_meta_data(2, "Cluster"), None);
    assert_eq!(store.meta_name_usage_count("Cluster"), 2);

    let histogram = store.histogram_meta_data(&[0, 1, 2], "Cluster");
    assert_eq!(
        histogram,
        vec![("2".to_string(), 1), ("9".to_string(), 1)]
    );
    Ok(())
}

#[test]
fn bulk_meta_data_matches_single_sets() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    for i in 0..5 {
        let name = format!("c{i}");
        store.add_cell(&[("CellName", &name)], &[("G0", 1.0 + i as f32)])?;
    }
    store.set_cell_meta_data(2, "Cluster", "stale")?;

    let assignments: Vec<(u32, String)> =
        (0..5).map(|i| (i, format!("k{}", i % 2))).collect();
    store.set_cell_meta_data_bulk("Cluster", &assignments)?;

    for i in 0..5u32 {
        assert_eq!(
            store.get_cell_meta_data(i, "Cluster"),
            Some(format!("k{}", i % 2).as_str())
        );
    }
    // 4 appended + 1 overwritten.
    assert_eq!(store.meta_name_usage_count("Cluster"), 5);
    Ok(())
}

#[test]
fn exact_similarity_scenarios() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    // Scaled cells over three genes correlate perfectly.
    let c1 = store.add_cell(
        &[("CellName", "c1")],
        &[("A", 1.0), ("B", 2.0), ("C", 3.0)],
    )?;
    let c2 = store.add_cell(
        &[("CellName", "c2")],
        &[("A", 2.0), ("B", 4.0), ("C", 6.0)],
    )?;
    assert_abs_diff_eq!(store.cell_similarity(c1, c2), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(store.cell_similarity(c1, c1), 1.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn orthogonal_cells_anticorrelate() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    let c1 = store.add_cell(&[("CellName", "c1")], &[("A", 1.0), ("B", 0.0)])?;
    let c2 = store.add_cell(&[("CellName", "c2")], &[("B", 1.0)])?;
    assert_eq!(store.gene_count(), 2);
    assert_abs_diff_eq!(store.cell_similarity(c1, c2), -1.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn empty_cell_similarity_is_nan() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;

    let c1 = store.add_cell(&[("CellName", "c1")], &[("A", 1.0), ("B", 2.0)])?;
    let empty = store.add_cell(&[("CellName", "empty")], &[])?;
    assert!(store.cell_similarity(c1, empty).is_nan());
    assert!(store.cell_similarity(empty, empty).is_nan());
    Ok(())
}

#[test]
fn expression_vector_normalization() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    let cell = store.add_cell(
        &[("CellName", "c0")],
        &[("A", 3.0), ("B", 4.0)],
    )?;
    let gene_set = store.gene_set("AllGenes").unwrap();

    let l1 = store.expression_vector(cell, gene_set, Normalization::L1);
    let sum: f64 = l1.iter().map(|e| e.count as f64).sum();
    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);

    let l2 = store.expression_vector(cell, gene_set, Normalization::L2);
    let sum2: f64 = l2.iter().map(|e| (e.count as f64).powi(2)).sum();
    assert_abs_diff_eq!(sum2, 1.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn gene_registration_is_idempotent() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    assert!(store.add_gene("ACTB")?);
    assert!(!store.add_gene("ACTB")?);
    assert_eq!(store.gene_count(), 1);
    assert_eq!(store.gene_set("AllGenes").unwrap().ids(), &[0]);
    Ok(())
}
