//! Read cache and write invalidation through the public engine API
//!
//! A cached read stays valid until a write overlapping it (same sheet, rows
//! and columns both intersecting) lands upstream.

#[path = "testutils/mod.rs"]
mod testutils;

use sheetsync::{grid, EngineConfig, RangeRef, WriteOptions};
use std::time::Duration;
use testutils::test_fixture::{TestFixture, SPREADSHEET};

fn r(s: &str) -> RangeRef {
    s.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_disjoint_write_keeps_read_and_overlapping_write_evicts_it() {
    let fixture = TestFixture::new();
    fixture.seed_block("Sheet1!A1:B10", 10, 2);
    let engine = &fixture.engine;

    let before = engine.read(SPREADSHEET, "Sheet1!A1:B10").await.unwrap();
    assert_eq!(before.len(), 10);
    assert_eq!(fixture.upstream.fetch_calls(), 1);

    // C1:D5 shares rows but no columns with A1:B10
    engine
        .write(
            SPREADSHEET,
            "Sheet1!C1:D5",
            grid(vec![vec!["c", "d"]; 5]),
            WriteOptions::default(),
        )
        .await
        .unwrap();
    let cached = engine.read(SPREADSHEET, "Sheet1!A1:B10").await.unwrap();
    assert_eq!(cached, before);
    assert_eq!(fixture.upstream.fetch_calls(), 1);

    // A5:B5 lies inside A1:B10
    engine
        .write(
            SPREADSHEET,
            "Sheet1!A5:B5",
            grid(vec![vec!["x", "y"]]),
            WriteOptions::default(),
        )
        .await
        .unwrap();
    let after = engine.read(SPREADSHEET, "Sheet1!A1:B10").await.unwrap();
    assert_eq!(fixture.upstream.fetch_calls(), 2);
    assert_eq!(after[4], grid(vec![vec!["x", "y"]])[0]);
    assert_eq!(after[3], before[3]);

    let stats = engine.cache_stats();
    assert_eq!(stats.hits, 1);
    assert!(stats.invalidations >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_to_other_sheet_does_not_invalidate() {
    let fixture = TestFixture::new();
    fixture.upstream.add_sheet(SPREADSHEET, "Other");
    fixture.seed("Sheet1!A1:B2", vec![vec!["1", "2"], vec!["3", "4"]]);
    let engine = &fixture.engine;

    engine.read(SPREADSHEET, "Sheet1!A1:B2").await.unwrap();
    engine
        .write(
            SPREADSHEET,
            "Other!A1:B2",
            grid(vec![vec!["x", "x"], vec!["x", "x"]]),
            WriteOptions::default(),
        )
        .await
        .unwrap();
    engine.read(SPREADSHEET, "Sheet1!A1:B2").await.unwrap();
    assert_eq!(fixture.upstream.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_append_invalidates_reads_below_its_start() {
    let fixture = TestFixture::new();
    fixture.seed_block("Sheet1!A1:B10", 10, 2);
    let engine = &fixture.engine;

    let before = engine.read(SPREADSHEET, "Sheet1!A1:B20").await.unwrap();
    assert_eq!(before.len(), 10);

    let report = engine
        .append(SPREADSHEET, "Sheet1!A1:B1", grid(vec![vec!["n1", "n2"]]))
        .await
        .unwrap();
    assert_eq!(report.range, r("Sheet1!A11:B11"));
    assert_eq!(report.updated_cells, 2);

    let after = engine.read(SPREADSHEET, "Sheet1!A1:B20").await.unwrap();
    assert_eq!(after.len(), 11);
    assert_eq!(fixture.upstream.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_invalidates_and_reads_back_empty() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "2"]]);
    let engine = &fixture.engine;

    engine.read(SPREADSHEET, "Sheet1!A1:B1").await.unwrap();
    engine.clear(SPREADSHEET, "Sheet1!A1:B1").await.unwrap();
    let after = engine.read(SPREADSHEET, "Sheet1!A1:B1").await.unwrap();
    assert!(after.is_empty());
    assert_eq!(fixture.upstream.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_entries_expire_after_ttl() {
    let config = EngineConfig {
        cache_ttl_ms: 1_000,
        ..EngineConfig::default()
    };
    let fixture = TestFixture::with_config(config);
    fixture.seed("Sheet1!A1", vec![vec!["v"]]);
    let engine = &fixture.engine;

    engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap();
    engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap();
    assert_eq!(fixture.upstream.fetch_calls(), 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap();
    assert_eq!(fixture.upstream.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_band_change_visible_after_spreadsheet_invalidation() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["old"]]);
    let engine = &fixture.engine;

    engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap();
    fixture.seed("Sheet1!A1", vec![vec!["new"]]);
    // Still cached
    assert_eq!(
        engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap(),
        grid(vec![vec!["old"]])
    );

    assert_eq!(engine.invalidate_spreadsheet(SPREADSHEET), 1);
    assert_eq!(
        engine.read(SPREADSHEET, "Sheet1!A1").await.unwrap(),
        grid(vec![vec!["new"]])
    );
    assert!(engine.fingerprint(SPREADSHEET, "Sheet1!A1").unwrap().is_some());
}
