use expr_alg::LshModel;
use expr_store::{ExpressionStore, ExpressionSubset, StoreParams};
use tempfile::tempdir;

fn small_params() -> StoreParams {
    StoreParams {
        gene_capacity: 1024,
        cell_capacity: 1024,
        cell_meta_data_name_capacity: 128,
        cell_meta_data_value_capacity: 4096,
    }
}

/// A store whose cells are deterministic pseudo-random vectors over
/// `gene_count` genes.
fn synthetic_store(
    dir: &std::path::Path,
    gene_count: usize,
    cell_count: usize,
) -> anyhow::Result<ExpressionStore> {
    let mut store = ExpressionStore::create(dir.join("store"), &small_params())?;
    let gene_names: Vec<String> = (0..gene_count).map(|g| format!("G{g}")).collect();
    for c in 0..cell_count {
        let name = format!("cell{c}");
        // A fixed quadratic recurrence gives scattered but reproducible
        // sparse counts.
        let counts: Vec<(&str, f32)> = (0..gene_count)
            .filter(|g| (g * 7 + c * 13 + g * g) % 3 == 0)
            .map(|g| {
                (
                    gene_names[g].as_str(),
                    1.0 + ((c * 31 + g * 17) % 10) as f32,
                )
            })
            .collect();
        store.add_cell(&[("CellName", &name)], &counts)?;
    }
    Ok(store)
}

#[test]
fn signatures_are_byte_identical_across_runs() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = synthetic_store(dir.path(), 60, 30)?;
    let subset = ExpressionSubset::new(
        &store,
        store.gene_set("AllGenes").unwrap(),
        store.cell_set("AllCells").unwrap(),
    );

    let first = LshModel::new(&subset, 1024, 42, None)?;
    let second = LshModel::new(&subset, 1024, 42, None)?;
    assert_eq!(
        first.signatures().as_words(),
        second.signatures().as_words()
    );

    let other_seed = LshModel::new(&subset, 1024, 43, None)?;
    assert_ne!(
        first.signatures().as_words(),
        other_seed.signatures().as_words()
    );
    Ok(())
}

#[test]
fn estimate_stays_in_range_and_tracks_exact_similarity() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = synthetic_store(dir.path(), 80, 25)?;
    let subset = ExpressionSubset::new(
        &store,
        store.gene_set("AllGenes").unwrap(),
        store.cell_set("AllCells").unwrap(),
    );

    let bit_count = 2048;
    let model = LshModel::new(&subset, bit_count, 42, None)?;

    // The angular estimate has standard deviation O(1/sqrt(L)); with
    // L = 2048 one sigma is ~0.035 on the similarity, so 0.2 is a wide
    // margin for every pair.
    let mut checked = 0;
    for a in 0..subset.cell_count() {
        for b in (a + 1)..subset.cell_count() {
            let estimate = model.similarity(a, b);
            assert!((-1.0..=1.0).contains(&estimate));
            let exact = subset.cell_similarity(a, b);
            if exact.is_finite() {
                assert!(
                    (estimate - exact).abs() < 0.2,
                    "cells ({a}, {b}): estimate {estimate} vs exact {exact}"
                );
                checked += 1;
            }
        }
    }
    assert!(checked > 0);
    Ok(())
}

#[test]
fn identical_cells_have_identical_signatures() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    let counts = [("G0", 1.0), ("G1", 2.0), ("G2", 3.0)];
    store.add_cell(&[("CellName", "a")], &counts)?;
    store.add_cell(&[("CellName", "b")], &counts)?;
    let subset = ExpressionSubset::new(
        &store,
        store.gene_set("AllGenes").unwrap(),
        store.cell_set("AllCells").unwrap(),
    );

    let model = LshModel::new(&subset, 512, 42, None)?;
    assert_eq!(model.signature_words(0), model.signature_words(1));
    assert_eq!(model.similarity(0, 1), 1.0);
    Ok(())
}

#[test]
fn empty_subset_yields_empty_model() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut store = ExpressionStore::create(dir.path().join("store"), &small_params())?;
    store.add_cell(&[("CellName", "a")], &[("G0", 1.0)])?;
    store.create_gene_set_from_regex("NoGenes", "ZZZ.*")?;
    let subset = ExpressionSubset::new(
        &store,
        store.gene_set("NoGenes").unwrap(),
        store.cell_set("AllCells").unwrap(),
    );

    let model = LshModel::new(&subset, 64, 1, None)?;
    // With no genes every projection is non-positive, so no bits are set.
    assert!(model
        .signatures()
        .as_words()
        .iter()
        .all(|&word| word == 0));
    Ok(())
}
