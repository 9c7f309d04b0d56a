//! Request batching through the public engine API

#[path = "testutils/mod.rs"]
mod testutils;

use sheetsync::{
    grid, BatchOp, EngineError, OperationClass, RangeRef, UpstreamError, UpstreamRequest, WriteOptions,
};
use std::time::Duration;
use testutils::test_fixture::{TestFixture, SPREADSHEET};

fn r(s: &str) -> RangeRef {
    s.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_disjoint_writes_in_one_window_make_one_call() {
    let fixture = TestFixture::new();
    let engine = &fixture.engine;

    let (a, b, c) = tokio::join!(
        engine.write(SPREADSHEET, "Sheet1!A1", grid(vec![vec!["a"]]), WriteOptions::default()),
        engine.write(SPREADSHEET, "Sheet1!B2", grid(vec![vec!["b"]]), WriteOptions::default()),
        engine.write(SPREADSHEET, "Sheet1!C3", grid(vec![vec!["c"]]), WriteOptions::default()),
    );

    assert_eq!(fixture.upstream.apply_calls(), 1);
    assert_eq!(a.unwrap().range, r("Sheet1!A1"));
    assert_eq!(b.unwrap().range, r("Sheet1!B2"));
    assert_eq!(c.unwrap().range, r("Sheet1!C3"));

    // Submission order survives the merge
    let applied = fixture.upstream.applied_requests();
    assert_eq!(applied.len(), 1);
    match &applied[0].1[..] {
        [UpstreamRequest::UpdateValues { data }] => {
            let ranges: Vec<RangeRef> = data.iter().map(|vr| vr.range.clone()).collect();
            assert_eq!(ranges, vec![r("Sheet1!A1"), r("Sheet1!B2"), r("Sheet1!C3")]);
        }
        other => panic!("expected one merged update, got {:?}", other),
    }
    fixture.assert_upstream("Sheet1!A1:C3", vec![vec!["a"], vec!["", "b"], vec!["", "", "c"]]);
}

#[tokio::test(start_paused = true)]
async fn test_reads_of_the_same_range_share_one_fetch() {
    let fixture = TestFixture::new();
    fixture.seed("Sheet1!A1:B1", vec![vec!["1", "2"]]);
    let engine = &fixture.engine;

    let (first, second) = tokio::join!(
        engine.read(SPREADSHEET, "Sheet1!A1:B1"),
        engine.read(SPREADSHEET, "Sheet1!A1:B1"),
    );
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(fixture.upstream.upstream_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_adapts_to_load() {
    let fixture = TestFixture::new();
    let engine = fixture.engine.clone();
    assert_eq!(
        engine.batch_window(SPREADSHEET, OperationClass::Write),
        Duration::from_millis(50)
    );

    // 50 ops in one window, well above the target of 10
    let mut handles = Vec::new();
    for row in 1..=50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .write(
                    SPREADSHEET,
                    &format!("Sheet1!A{}", row),
                    grid(vec![vec![row as i64]]),
                    WriteOptions::default(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(fixture.upstream.apply_calls(), 1);
    assert_eq!(
        engine.batch_window(SPREADSHEET, OperationClass::Write),
        Duration::from_millis(40)
    );

    // A quiet window grows it back
    engine
        .write(SPREADSHEET, "Sheet1!B1", grid(vec![vec!["quiet"]]), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        engine.batch_window(SPREADSHEET, OperationClass::Write),
        Duration::from_millis(48)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_fails_only_its_own_ops() {
    let fixture = TestFixture::new();
    fixture.upstream.reject_writes_to(SPREADSHEET, "Sheet1!Z1:Z5").unwrap();
    let engine = &fixture.engine;

    let (good, bad) = tokio::join!(
        engine.write(SPREADSHEET, "Sheet1!A1", grid(vec![vec!["ok"]]), WriteOptions::default()),
        engine.clear(SPREADSHEET, "Sheet1!Z1"),
    );
    assert!(good.is_ok());
    match bad {
        Err(EngineError::BatchPartialFailure { range, message, .. }) => {
            assert_eq!(range, "Sheet1!Z1");
            assert!(message.contains("protected"));
        }
        other => panic!("expected a partial failure, got {:?}", other),
    }
    assert_eq!(fixture.upstream.apply_calls(), 1);
    fixture.assert_upstream("Sheet1!A1", vec![vec!["ok"]]);

    fixture.upstream.clear_rejections();
    fixture.upstream.reset_counters();
    engine.clear(SPREADSHEET, "Sheet1!Z1").await.unwrap();
    assert_eq!(fixture.upstream.apply_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_call_fails_every_op_in_the_batch() {
    let fixture = TestFixture::new();
    fixture
        .upstream
        .push_apply_failure(UpstreamError::Rejected("spreadsheet is read-only".into()));
    let engine = &fixture.engine;

    let (first, second) = tokio::join!(
        engine.write(SPREADSHEET, "Sheet1!A1", grid(vec![vec!["a"]]), WriteOptions::default()),
        engine.write(SPREADSHEET, "Sheet1!B1", grid(vec![vec!["b"]]), WriteOptions::default()),
    );
    for result in [first, second] {
        match result {
            Err(EngineError::Upstream { operation, source, .. }) => {
                assert_eq!(operation, "apply");
                assert!(!source.is_transient());
            }
            other => panic!("expected an upstream failure, got {:?}", other),
        }
    }
    // Permanent errors are not retried
    assert_eq!(fixture.upstream.apply_calls(), 1);
    assert_eq!(engine.batch_stats().ops_failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_read_never_reaches_upstream() {
    let fixture = TestFixture::new();
    let engine = &fixture.engine;
    let cancel = tokio_util::sync::CancellationToken::new();

    let read = engine.read_with_cancel(SPREADSHEET, "Sheet1!A1", &cancel);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(read, trigger);
    assert!(matches!(result, Err(EngineError::Cancelled { .. })));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fixture.upstream.upstream_calls(), 0);
    assert_eq!(engine.batch_stats().ops_cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transaction_ops_reuse_the_batch_planner() {
    let fixture = TestFixture::new();
    let engine = &fixture.engine;
    let id = engine
        .begin_transaction(SPREADSHEET, sheetsync::IsolationLevel::ReadCommitted)
        .unwrap();
    for (range, rows) in [("Sheet1!A1:B1", 1), ("Sheet1!A1:B1", 2)] {
        engine
            .add_operation(
                id,
                BatchOp::Append {
                    range: r(range),
                    rows: grid(vec![vec!["row", "x"]; rows]),
                },
            )
            .await
            .unwrap();
    }
    let report = engine.commit(id).await.unwrap();
    assert_eq!(report.upstream_calls, 1);
    assert_eq!(fixture.upstream_values("Sheet1!A1:B5").len(), 3);
}
