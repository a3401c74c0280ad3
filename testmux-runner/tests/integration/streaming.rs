// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! unittest runs, with results streamed over the loopback socket while the process runs.

use crate::fixtures::{Harness, StaticSettings, WORKSPACE_ROOT, exited, send_lines};
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::time::Duration;
use testmux_runner::{
    errors::{IncompleteReason, RunTestsError},
    events::ManagerEvent,
    manager::{DID_NOT_COMPLETE, ManagerPhase, RunRequest},
    provider::TestProvider,
    runner::{RUN_ID_ENV, RunnerState},
    tree::{StableId, TestStatus},
};

const A: &str = "test_m.py::T::test_a";
const B: &str = "test_m.py::T::test_b";
const C: &str = "test_m.py::T::test_c";

fn unittest_all() -> RunRequest {
    RunRequest::all(TestProvider::Unittest, WORKSPACE_ROOT)
}

#[tokio::test]
async fn streamed_outcomes_are_applied() -> Result<()> {
    let harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[
                r#"{"event": "started", "id": "test_m.py::T::test_a"}"#,
                r#"{"event": "passed", "id": "test_m.py::T::test_a", "duration": 0.25}"#,
                r#"{"event": "failed", "id": "test_m.py::T::test_b", "message": "AssertionError: 1 != 2", "traceback": "Traceback (most recent call last):\n  ..."}"#,
                r#"{"event": "skipped", "id": "test_m.py::T::test_c", "message": "not on this platform"}"#,
                r#"{"event": "end"}"#,
            ],
        )
        .await;
        exited(1)
    });

    let summary = harness.manager.run_tests(unittest_all()).await?;

    assert_eq!(summary.state, RunnerState::Completed);
    assert!(summary.process_error.is_none());
    assert!(summary.incomplete.is_none());
    assert_eq!(
        (summary.stats.passed, summary.stats.failed, summary.stats.skipped),
        (1, 1, 1)
    );
    assert_eq!(harness.status(A), TestStatus::Pass);
    assert_eq!(harness.status(B), TestStatus::Fail);
    assert_eq!(
        harness.message(B).as_deref(),
        Some("AssertionError: 1 != 2")
    );
    assert_eq!(harness.status(C), TestStatus::Skip);
    assert_eq!(harness.status("test_m.py::T"), TestStatus::Fail);

    let duration = harness.manager.with_tree(|tree, index| {
        let node = index.get(&StableId::new(A))?;
        tree.node(node).last_run().duration
    });
    assert_eq!(duration, Some(Some(Duration::from_millis(250))));

    let runs = harness.spawner.runs();
    assert_eq!(
        runs[0].env_var(RUN_ID_ENV),
        Some(summary.run_id.to_string().as_str())
    );
    Ok(())
}

#[tokio::test]
async fn disconnect_settles_unreported_tests_as_errors() -> Result<()> {
    let harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[
                r#"{"event": "passed", "id": "test_m.py::T::test_a"}"#,
                r#"{"event": "failed", "id": "test_m.py::T::test_b", "message": "boom"}"#,
            ],
        )
        .await;
        // The connection closes without an end marker.
        drop(stream);
        exited(0)
    });

    let summary = harness.manager.run_tests(unittest_all()).await?;

    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(harness.status(A), TestStatus::Pass);
    assert_eq!(harness.status(B), TestStatus::Fail);
    assert_eq!(harness.status(C), TestStatus::Error);
    assert_eq!(
        harness.message(C),
        Some(format!("{DID_NOT_COMPLETE}: result stream disconnected"))
    );
    assert_eq!(harness.status(StableId::ROOT), TestStatus::Error);

    let incomplete = summary.incomplete.expect("run was incomplete");
    assert_eq!(incomplete.reason(), IncompleteReason::StreamDisconnected);
    assert_eq!(incomplete.ids(), [StableId::new(C)]);
    Ok(())
}

#[tokio::test]
async fn end_marker_with_missing_outcomes() -> Result<()> {
    let harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[
                r#"{"event": "passed", "id": "test_m.py::T::test_a"}"#,
                "this line is not json",
                r#"{"event": "end"}"#,
            ],
        )
        .await;
        exited(0)
    });

    let summary = harness.manager.run_tests(unittest_all()).await?;

    let incomplete = summary.incomplete.expect("run was incomplete");
    assert_eq!(incomplete.reason(), IncompleteReason::MissingOutcomes);
    assert_eq!(incomplete.ids(), [StableId::new(B), StableId::new(C)]);
    assert_eq!(harness.status(A), TestStatus::Pass);
    assert_eq!(summary.stats.errored, 2);
    Ok(())
}

#[tokio::test]
async fn process_that_never_connects() -> Result<()> {
    let harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|_| async { exited(0) });

    let summary = harness.manager.run_tests(unittest_all()).await?;

    let incomplete = summary.incomplete.expect("run was incomplete");
    assert_eq!(incomplete.reason(), IncompleteReason::StreamNeverConnected);
    assert_eq!(incomplete.ids().len(), 3);
    for id in [A, B, C] {
        assert_eq!(harness.status(id), TestStatus::Error, "{id} settled as an error");
    }
    Ok(())
}

#[tokio::test]
async fn timeout_cancels_and_settles_as_errors() -> Result<()> {
    let harness = Harness::new(
        TestProvider::Unittest,
        StaticSettings {
            run_timeout: Duration::from_millis(300),
            ..StaticSettings::default()
        },
    );
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[r#"{"event": "passed", "id": "test_m.py::T::test_a"}"#],
        )
        .await;
        std::future::pending::<()>().await;
        exited(0)
    });

    let summary = harness.manager.run_tests(unittest_all()).await?;

    assert_eq!(summary.state, RunnerState::Cancelled);
    assert!(summary.timed_out);
    assert_eq!(harness.status(A), TestStatus::Pass, "received outcomes are kept");
    assert_eq!(harness.status(B), TestStatus::Error);
    assert_eq!(
        harness.message(B),
        Some(format!("{DID_NOT_COMPLETE}: run timed out"))
    );
    let incomplete = summary.incomplete.expect("run was incomplete");
    assert_eq!(incomplete.reason(), IncompleteReason::TimedOut);
    assert_eq!(harness.manager.phase(), ManagerPhase::Ready);
    Ok(())
}

#[tokio::test]
async fn stop_cancels_the_run_and_rejects_concurrent_runs() -> Result<()> {
    let mut harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[
                r#"{"event": "passed", "id": "test_m.py::T::test_a"}"#,
                r#"{"event": "started", "id": "test_m.py::T::test_b"}"#,
            ],
        )
        .await;
        std::future::pending::<()>().await;
        exited(0)
    });

    let manager = harness.manager.clone();
    let run = tokio::spawn(async move { manager.run_tests(unittest_all()).await });
    harness.wait_for_status(B, TestStatus::Running).await;
    assert_eq!(harness.status(A), TestStatus::Pass);

    let err = harness
        .manager
        .run_tests(unittest_all())
        .await
        .expect_err("a second run is rejected");
    match err {
        RunTestsError::Concurrent(err) => assert_eq!(err.phase(), ManagerPhase::Running),
        other => panic!("unexpected error: {other}"),
    }

    harness.manager.stop_tests().await;
    assert_eq!(harness.manager.phase(), ManagerPhase::Ready);

    let summary = run.await??;
    assert_eq!(summary.state, RunnerState::Cancelled);
    assert!(!summary.timed_out);
    assert!(summary.incomplete.is_none(), "stopped runs don't report errors");
    assert_eq!(harness.status(A), TestStatus::Pass);
    assert_eq!(harness.status(B), TestStatus::NotRun);
    assert_eq!(harness.status(C), TestStatus::NotRun);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_is_settled_when_stop_returns() -> Result<()> {
    let mut harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        let mut stream = run.connect().await;
        send_lines(
            &mut stream,
            &[
                r#"{"event": "passed", "id": "test_m.py::T::test_a"}"#,
                r#"{"event": "started", "id": "test_m.py::T::test_b"}"#,
            ],
        )
        .await;
        std::future::pending::<()>().await;
        exited(0)
    });

    let manager = harness.manager.clone();
    let run = tokio::spawn(async move { manager.run_tests(unittest_all()).await });
    harness.wait_for_status(B, TestStatus::Running).await;

    harness.manager.stop_tests().await;

    // Nothing from the stopped run may be pending once stop_tests has returned.
    let (phase, b_status) = harness
        .manager
        .with_tree(|tree, index| {
            let b = index.get(&StableId::new(B)).expect("B is in the tree");
            (harness.manager.phase(), tree.node(b).status())
        })
        .expect("tree was discovered");
    assert_eq!(phase, ManagerPhase::Ready);
    assert_eq!(b_status, TestStatus::NotRun);

    let mut completion = None;
    while let Ok(event) = harness.events.try_recv() {
        if let ManagerEvent::RunCompleted(done) = event {
            completion = Some(done);
        }
    }
    let completion = completion.expect("run completion was sent before stop_tests returned");
    assert_eq!(completion.state, RunnerState::Cancelled);
    assert_eq!(completion.stats.passed, 1);
    assert_eq!(completion.stats.not_run, 2);

    let summary = run.await??;
    assert_eq!(summary.state, RunnerState::Cancelled);
    Ok(())
}

#[tokio::test]
async fn stop_without_an_active_run_is_a_no_op() {
    let harness = Harness::new(TestProvider::Unittest, StaticSettings::default());
    harness.manager.stop_tests().await;
    assert_eq!(harness.manager.phase(), ManagerPhase::Uninitialized);
}
