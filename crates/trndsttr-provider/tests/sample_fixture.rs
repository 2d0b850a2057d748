use trndsttr_core::{Geo, IngestionBatch, Timeframe, WideTable};
use trndsttr_provider::{FixtureProvider, TrendsProvider};

fn sample_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/sample/interest_over_time.json")
}

#[tokio::test]
async fn sample_fixture_serves_requested_columns() {
    let provider = FixtureProvider::from_path(sample_path()).expect("sample fixture loads");
    let batch = IngestionBatch::new(
        vec!["Addison Rae".to_string(), "Taylor Swift".to_string()],
        Timeframe::Last3Months,
        Geo::UnitedStates,
    )
    .unwrap();

    let table = provider.interest_over_time(&batch).await.expect("fixture fetch");
    assert_eq!(
        table.columns,
        vec![WideTable::TIME_COLUMN, WideTable::PARTIAL_COLUMN, "Addison Rae", "Taylor Swift"]
    );
    assert_eq!(table.rows.len(), 28);
    assert!(table.rows.iter().all(|row| row.len() == 4));
}
