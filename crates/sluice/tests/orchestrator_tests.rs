//! Concurrency, shutdown and fatal-error behavior of the orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::TestHarness;
use sluice::classify::KeyBuilder;
use sluice::db::Database;
use sluice::error::WorkerError;
use sluice::ledger::{ProgressLedger, ProgressStatus};
use sluice::pipeline::{FatalError, FileOutcome, FilePipeline, NoopProgress};
use sluice::storage::ErrorArea;
use sluice::worker::{DirectoryScanner, Orchestrator, OrchestratorOptions};

#[tokio::test]
async fn scanned_tree_is_processed_concurrently() {
    let h = TestHarness::new();
    for i in 0..12 {
        h.write_input(&format!("batch/{}/file_{i}.txt", i % 3), format!("payload {i}").as_bytes());
    }
    h.write_input("tables/rows.csv", b"a,b\n1,2\n");
    h.store.set_put_delay(Duration::from_millis(20));

    let mut orchestrator = h.orchestrator(4);
    let mut reports = orchestrator.subscribe();
    let sender = orchestrator.start().unwrap();

    let found = DirectoryScanner::new(&h.watch_dir, &h.error_dir).scan().unwrap();
    assert_eq!(found.len(), 13);
    for event in found {
        sender.send(event).await.unwrap();
    }

    let mut completed = 0;
    while completed < 13 {
        let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .expect("timed out waiting for reports")
            .unwrap();
        assert!(matches!(report.outcome, FileOutcome::Completed { .. }), "{report:?}");
        completed += 1;
    }

    let stop = orchestrator.stop(Duration::from_secs(5)).await;
    assert!(stop.drained);
    assert_eq!(stop.dropped, 0);
    assert_eq!(h.store.keys().len(), 13);
    assert!(h.store.object("tables/rows.parquet").is_some());
    assert_eq!(h.ledger.count_by_status(ProgressStatus::Completed).unwrap(), 13);
}

#[tokio::test]
async fn rescanning_after_completion_skips_everything() {
    let h = TestHarness::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        h.write_input(name, name.as_bytes());
    }
    let scanner = DirectoryScanner::new(&h.watch_dir, &h.error_dir);

    for round in 0..2 {
        let mut orchestrator = h.orchestrator(2);
        let mut reports = orchestrator.subscribe();
        let sender = orchestrator.start().unwrap();
        for event in scanner.scan().unwrap() {
            sender.send(event).await.unwrap();
        }
        for _ in 0..3 {
            let report = reports.recv().await.unwrap();
            if round == 1 {
                assert!(matches!(report.outcome, FileOutcome::Skipped { .. }));
            }
        }
        orchestrator.stop(Duration::from_secs(5)).await;
    }

    assert_eq!(h.store.put_calls(), 3);
}

#[tokio::test]
async fn aborted_work_is_reconciled_by_recovery() {
    let h = TestHarness::new();
    h.store.set_put_delay(Duration::from_secs(60));
    let event = h.write_input("stuck.bin", b"never finishes");

    let mut orchestrator = h.orchestrator(1);
    let sender = orchestrator.start().unwrap();
    sender.send(event.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stop = orchestrator.stop(Duration::from_millis(50)).await;
    assert_eq!(stop.aborted, vec![event.absolute_path.clone()]);
    assert_eq!(h.record(&event).unwrap().status, ProgressStatus::InProgress);

    let report = h.recover().await;
    assert_eq!(report.reset, 1);
    assert!(h.record(&event).is_none());

    h.store.set_put_delay(Duration::ZERO);
    assert!(matches!(h.process(&event).await, FileOutcome::Completed { .. }));
    assert_eq!(h.store.keys(), vec!["stuck.bin"]);
}

#[tokio::test]
async fn ledger_failure_stops_intake_and_is_reported() {
    let h = TestHarness::new();
    let db = Database::open_in_memory().unwrap();
    let pipeline = FilePipeline::new(
        ProgressLedger::new(db.clone()),
        h.uploader(),
        KeyBuilder::default(),
        ErrorArea::new(&h.error_dir),
        h.work_dir.clone(),
    );
    db.with_conn(|conn| Ok(conn.execute_batch("DROP TABLE progress")?))
        .unwrap();

    let mut orchestrator = Orchestrator::new(
        Arc::new(pipeline),
        OrchestratorOptions {
            worker_count: 2,
            queue_capacity: 8,
        },
    )
    .with_progress(Arc::new(NoopProgress));
    let mut stopping = orchestrator.shutdown_signal();
    let sender = orchestrator.start().unwrap();

    sender.send(h.write_input("doomed.txt", b"x")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), stopping.wait_for(|s| *s))
        .await
        .expect("fatal error did not trigger shutdown")
        .unwrap();
    assert!(!sender.is_accepting());
    assert!(matches!(
        sender.send(h.write_input("late.txt", b"y")).await,
        Err(WorkerError::NotAccepting)
    ));

    let stop = orchestrator.stop(Duration::from_secs(1)).await;
    assert!(matches!(stop.fatal, Some(FatalError::Ledger { .. })));
    assert!(h.store.keys().is_empty());
}

#[tokio::test]
async fn per_file_failures_do_not_disturb_other_files() {
    let h = TestHarness::new();
    let good = h.write_input("good.txt", b"fine");
    let bad = h.write_input("bad.zip", b"garbage");

    let mut orchestrator = h.orchestrator(2);
    let mut reports = orchestrator.subscribe();
    let sender = orchestrator.start().unwrap();
    sender.send(bad.clone()).await.unwrap();
    sender.send(good.clone()).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let report = reports.recv().await.unwrap();
        outcomes.push((report.path, report.outcome));
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    assert!(matches!(outcomes[0].1, FileOutcome::Failed { .. }));
    assert!(matches!(outcomes[1].1, FileOutcome::Completed { .. }));
    let stop = orchestrator.stop(Duration::from_secs(5)).await;
    assert!(stop.fatal.is_none());
    assert_eq!(h.record(&bad).unwrap().status, ProgressStatus::Failed);
    assert_eq!(h.record(&good).unwrap().status, ProgressStatus::Completed);
}

#[tokio::test]
async fn file_rewritten_during_upload_is_reprocessed() {
    let h = TestHarness::new();
    h.store.set_put_delay(Duration::from_millis(300));
    let mut orchestrator = h.orchestrator(2);
    let mut reports = orchestrator.subscribe();
    let sender = orchestrator.start().unwrap();

    sender.send(h.write_input("a.txt", b"v1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rewritten = h.write_input("a.txt", b"version two");
    sender.send(rewritten.clone()).await.unwrap();

    for _ in 0..2 {
        let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .expect("timed out waiting for reports")
            .unwrap();
        assert!(matches!(report.outcome, FileOutcome::Completed { .. }), "{report:?}");
    }
    let stop = orchestrator.stop(Duration::from_secs(5)).await;
    assert!(stop.drained);

    let expected = sluice::checksum::sha256_bytes(b"version two");
    assert_eq!(h.store.put_calls(), 2);
    let object = h.store.object("a.txt").unwrap();
    assert_eq!(object.body, b"version two");
    assert_eq!(
        object
            .metadata
            .get(sluice::store::SOURCE_SHA256_KEY)
            .map(String::as_str),
        Some(expected.as_str())
    );
    let record = h.record(&rewritten).unwrap();
    assert_eq!(record.status, ProgressStatus::Completed);
    assert_eq!(record.checksum.as_deref(), Some(expected.as_str()));
}
