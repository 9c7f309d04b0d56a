//! Guarded writes: conflict detection and resolution strategies

#[path = "testutils/mod.rs"]
mod testutils;

use chrono::{Duration, Utc};
use sheetsync::{
    grid, ConflictCheck, ConflictStrategy, EngineError, Severity, StrategyTag, TieBreak,
    WriteOptions,
};
use testutils::test_fixture::{TestFixture, SPREADSHEET};

/// Read a range so the engine records its fingerprint, then return it
async fn observe(fixture: &TestFixture, range: &str) -> sheetsync::Fingerprint {
    fixture.engine.read(SPREADSHEET, range).await.unwrap();
    fixture
        .engine
        .fingerprint(SPREADSHEET, range)
        .unwrap()
        .expect("fingerprint recorded by read")
}

fn column(prefix: &str, rows: usize) -> Vec<Vec<String>> {
    (0..rows).map(|r| vec![format!("{}{}", prefix, r)]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_range_writes_through() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "1"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;

    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["2", "2"]]),
            WriteOptions::guarded(expected),
        )
        .await
        .unwrap();
    assert!(report.applied);
    assert!(report.conflict.is_none());
    fixture.assert_upstream("Sheet1!A1:B1", vec![vec!["2", "2"]]);
}

#[tokio::test(start_paused = true)]
async fn test_divergence_without_strategy_is_reported() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "1"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "R"]]);

    let err = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["L", "1"]]),
            WriteOptions::guarded(expected),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::ConflictDetected(report) => {
            assert_eq!(report.changed_cells, 1);
            assert_eq!(report.severity, Severity::Low);
            assert!(!report.touches_protected);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    fixture.assert_upstream("Sheet1!A1:B1", vec![vec!["1", "R"]]);
}

#[tokio::test(start_paused = true)]
async fn test_merge_keeps_both_sides() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "1"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "R"]]);

    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["L", "1"]]),
            WriteOptions::guarded(expected).with_strategy(ConflictStrategy::Merge {
                tie_break: TieBreak::PreferRemote,
            }),
        )
        .await
        .unwrap();

    assert!(report.applied);
    assert_eq!(report.resolved_by, Some(StrategyTag::Merge));
    assert_eq!(report.updated_cells, 1);
    assert!(report.conflict.is_some());
    fixture.assert_upstream("Sheet1!A1:B1", vec![vec!["L", "R"]]);
}

#[tokio::test(start_paused = true)]
async fn test_merge_tie_break_on_cells_both_sides_changed() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "1"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;
    fixture.seed("Sheet1!A1:B1", vec![vec!["R", "R"]]);

    fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["L", "1"]]),
            WriteOptions::guarded(expected).with_strategy(ConflictStrategy::Merge {
                tie_break: TieBreak::PreferLocal,
            }),
        )
        .await
        .unwrap();
    fixture.assert_upstream("Sheet1!A1:B1", vec![vec!["L", "R"]]);
}

#[tokio::test(start_paused = true)]
async fn test_overwrite_replaces_remote() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "1"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "R"]]);

    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["L", "1"]]),
            WriteOptions::guarded(expected).with_strategy(ConflictStrategy::Overwrite),
        )
        .await
        .unwrap();
    assert!(report.applied);
    assert_eq!(report.resolved_by, Some(StrategyTag::Overwrite));
    fixture.assert_upstream("Sheet1!A1:B1", vec![vec!["L", "1"]]);
}

#[tokio::test(start_paused = true)]
async fn test_last_write_wins_drops_older_local_write() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["1"]]);
    let expected = observe(&fixture, "Sheet1!A1").await;
    fixture.seed("Sheet1!A1", vec![vec!["remote"]]);

    let stale = Utc::now() - Duration::hours(1);
    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["local"]]),
            WriteOptions::guarded(expected.clone())
                .with_strategy(ConflictStrategy::LastWriteWins)
                .issued_at(stale),
        )
        .await
        .unwrap();
    assert!(!report.applied);
    assert_eq!(report.updated_cells, 0);
    assert_eq!(report.resolved_by, Some(StrategyTag::LastWriteWins));
    fixture.assert_upstream("Sheet1!A1", vec![vec!["remote"]]);

    // A write issued now is newer than the remote version
    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["local"]]),
            WriteOptions::guarded(expected).with_strategy(ConflictStrategy::LastWriteWins),
        )
        .await
        .unwrap();
    assert!(report.applied);
    fixture.assert_upstream("Sheet1!A1", vec![vec!["local"]]);
}

#[tokio::test(start_paused = true)]
async fn test_first_write_wins_applies_older_local_write() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["1"]]);
    let expected = observe(&fixture, "Sheet1!A1").await;
    fixture.seed("Sheet1!A1", vec![vec!["remote"]]);

    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["local"]]),
            WriteOptions::guarded(expected)
                .with_strategy(ConflictStrategy::FirstWriteWins)
                .issued_at(Utc::now() - Duration::hours(1)),
        )
        .await
        .unwrap();
    assert!(report.applied);
    assert_eq!(report.resolved_by, Some(StrategyTag::FirstWriteWins));
    fixture.assert_upstream("Sheet1!A1", vec![vec!["local"]]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_strategy_fails_the_write() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["1"]]);
    let expected = observe(&fixture, "Sheet1!A1").await;
    fixture.seed("Sheet1!A1", vec![vec!["remote"]]);

    let result = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["local"]]),
            WriteOptions::guarded(expected).with_strategy(ConflictStrategy::Cancel),
        )
        .await;
    assert!(matches!(result, Err(EngineError::ConflictDetected(_))));
    fixture.assert_upstream("Sheet1!A1", vec![vec!["remote"]]);
    assert_eq!(fixture.upstream.apply_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_severity_grows_with_changed_cells() {
    let fixture = TestFixture::new();
    fixture
        .upstream
        .set_values(SPREADSHEET, "Sheet1!A1:A150", grid(column("old", 150)))
        .unwrap();
    let expected = observe(&fixture, "Sheet1!A1:A150").await;

    // One cell
    fixture.seed("Sheet1!A1", vec![vec!["changed"]]);
    let small = match fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:A150",
            grid(column("new", 150)),
            WriteOptions::guarded(expected.clone()),
        )
        .await
    {
        Err(EngineError::ConflictDetected(report)) => report,
        other => panic!("expected a conflict, got {:?}", other),
    };
    assert_eq!(small.changed_cells, 1);
    assert_eq!(small.severity, Severity::Low);

    // Every cell
    fixture
        .upstream
        .set_values(SPREADSHEET, "Sheet1!A1:A150", grid(column("remote", 150)))
        .unwrap();
    let large = match fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:A150",
            grid(column("new", 150)),
            WriteOptions::guarded(expected),
        )
        .await
    {
        Err(EngineError::ConflictDetected(report)) => report,
        other => panic!("expected a conflict, got {:?}", other),
    };
    assert_eq!(large.changed_cells, 150);
    assert_eq!(large.severity, Severity::Medium);
    assert!(large.severity >= small.severity);
}

#[tokio::test(start_paused = true)]
async fn test_formula_change_is_at_least_medium() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "=A1*2"]]);
    let expected = observe(&fixture, "Sheet1!A1:B1").await;
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "=A1*3"]]);

    let err = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B1",
            grid(vec![vec!["2", "=A1*2"]]),
            WriteOptions::guarded(expected),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::ConflictDetected(report) => {
            assert_eq!(report.formula_cells_changed, 1);
            assert_eq!(report.severity, Severity::Medium);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_protected_range_conflict_is_critical() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B2", vec![vec!["1", "2"], vec!["3", "4"]]);
    fixture
        .engine
        .protect_range(SPREADSHEET, "Sheet1!B1:B10")
        .unwrap();
    let expected = observe(&fixture, "Sheet1!A1:B2").await;
    fixture.seed("Sheet1!A1", vec![vec!["9"]]);

    let err = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1:B2",
            grid(vec![vec!["5", "6"], vec!["7", "8"]]),
            WriteOptions::guarded(expected),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::ConflictDetected(report) => {
            assert!(report.touches_protected);
            assert!(report.severity >= Severity::High);
            assert_eq!(report.severity, Severity::Critical);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_engine_write_does_not_conflict_with_itself() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["1"]]);
    observe(&fixture, "Sheet1!A1").await;

    fixture
        .engine
        .write(SPREADSHEET, "Sheet1!A1", grid(vec![vec!["2"]]), WriteOptions::default())
        .await
        .unwrap();
    // The engine's own write made the old fingerprint stale
    assert!(fixture
        .engine
        .fingerprint(SPREADSHEET, "Sheet1!A1")
        .unwrap()
        .is_none());

    let current = observe(&fixture, "Sheet1!A1").await;
    let report = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["3"]]),
            WriteOptions::guarded(current),
        )
        .await
        .unwrap();
    assert!(report.applied);
    fixture.assert_upstream("Sheet1!A1", vec![vec!["3"]]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_write_elsewhere_does_not_hide_remote_change() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["base"]]);
    let expected = observe(&fixture, "Sheet1!A1").await;
    fixture.seed("Sheet1!A1", vec![vec!["remote"]]);
    fixture
        .upstream
        .set_latency(std::time::Duration::from_millis(100));

    // A write to a disjoint range lands while the guarded write fetches A1
    let engine = fixture.engine.clone();
    let unrelated = tokio::spawn(async move {
        engine
            .write(SPREADSHEET, "Sheet1!Z1", grid(vec![vec!["z"]]), WriteOptions::default())
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    let err = fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["local"]]),
            WriteOptions::guarded(expected),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictDetected(_)));
    unrelated.await.unwrap().unwrap();

    fixture.assert_upstream("Sheet1!A1", vec![vec!["remote"]]);
    fixture.assert_upstream("Sheet1!Z1", vec![vec!["z"]]);
}

#[tokio::test(start_paused = true)]
async fn test_local_check_uses_last_observed_version() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1", vec![vec!["1"]]);
    let expected = observe(&fixture, "Sheet1!A1").await;
    assert_eq!(
        fixture
            .engine
            .check_conflict(SPREADSHEET, "Sheet1!A1", &expected)
            .unwrap(),
        ConflictCheck::Clear
    );
    assert_eq!(
        fixture
            .engine
            .check_conflict(SPREADSHEET, "Sheet1!B7", &expected)
            .unwrap(),
        ConflictCheck::Unobserved
    );

    // The rejected guarded write observed the remote change
    fixture.seed("Sheet1!A1", vec![vec!["R"]]);
    fixture
        .engine
        .write(
            SPREADSHEET,
            "Sheet1!A1",
            grid(vec![vec!["L"]]),
            WriteOptions::guarded(expected.clone()),
        )
        .await
        .unwrap_err();
    match fixture
        .engine
        .check_conflict(SPREADSHEET, "Sheet1!A1", &expected)
        .unwrap()
    {
        ConflictCheck::Conflict(report) => assert_eq!(report.changed_cells, 1),
        other => panic!("expected a conflict, got {:?}", other),
    }
}
