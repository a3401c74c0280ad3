// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery, tree replacement and debug launches.

use crate::fixtures::{Harness, PYTEST_COLLECTION, StaticSettings, WORKSPACE_ROOT, exited};
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use testmux_runner::{
    errors::{DiscoverTestsError, RunTestsError},
    events::{ManagerEvent, MutationCause},
    manager::{ManagerPhase, RunRequest},
    provider::TestProvider,
    tree::{NodeIndex, StableId, TestStatus},
};

fn tree_ids(harness: &Harness) -> Vec<String> {
    harness
        .manager
        .with_tree(|tree, _| {
            tree.preorder(NodeIndex::ROOT)
                .map(|node| tree.node(node).id().to_string())
                .collect()
        })
        .unwrap_or_default()
}

const ONE_PASSING: &str = r#"
    <testsuites>
      <testsuite name="pytest" tests="1">
        <testcase classname="tests.test_math" name="test_add" file="tests/test_math.py" line="2" time="0.001" />
      </testsuite>
    </testsuites>
"#;

#[tokio::test]
async fn discovery_is_idempotent() -> Result<()> {
    let mut harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    assert_eq!(harness.manager.phase(), ManagerPhase::Uninitialized);
    assert!(harness.manager.tree_snapshot().is_none());

    harness.manager.discover_tests().await?;
    assert_eq!(harness.manager.phase(), ManagerPhase::Ready);
    let first = tree_ids(&harness);
    assert_eq!(
        first,
        [
            ".",
            "tests",
            "tests/test_math.py",
            "tests/test_math.py::test_add",
            "tests/test_math.py::TestDivide",
            "tests/test_math.py::TestDivide::test_by_one",
            "tests/test_math.py::TestDivide::test_by_zero",
            "tests/test_strings.py",
            "tests/test_strings.py::test_upper[a-A]",
            "tests/test_strings.py::test_upper[b-B]",
        ]
    );

    harness.manager.discover_tests().await?;
    assert_eq!(tree_ids(&harness), first);

    let mut causes = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        if let ManagerEvent::TreeMutated(mutation) = event {
            causes.push(mutation.cause);
        }
    }
    assert_eq!(causes, [MutationCause::Discovery, MutationCause::Discovery]);
    Ok(())
}

#[tokio::test]
async fn rediscovery_carries_results_forward() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        run.write_report(ONE_PASSING).await;
        exited(0)
    });
    harness
        .manager
        .run_tests(
            RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT)
                .with_subset([StableId::new("tests/test_math.py::test_add")]),
        )
        .await?;
    assert_eq!(harness.status("tests/test_math.py::test_add"), TestStatus::Pass);

    // A test is added and another removed.
    harness.spawner.set_collection(
        &PYTEST_COLLECTION.replace(
            "tests/test_math.py::TestDivide::test_by_zero",
            "tests/test_math.py::TestDivide::test_by_two",
        ),
        0,
    );
    harness.manager.discover_tests().await?;

    assert_eq!(harness.status("tests/test_math.py::test_add"), TestStatus::Pass);
    assert_eq!(
        harness.status("tests/test_math.py::TestDivide::test_by_two"),
        TestStatus::Discovered
    );
    assert_eq!(
        harness
            .manager
            .status_of(&StableId::new("tests/test_math.py::TestDivide::test_by_zero")),
        None
    );
    Ok(())
}

#[tokio::test]
async fn failed_discovery_keeps_the_previous_tree() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.manager.discover_tests().await?;
    let before = tree_ids(&harness);

    harness.spawner.set_collection("", 2);
    let err = harness
        .manager
        .discover_tests()
        .await
        .expect_err("collection failed");
    assert!(
        matches!(err, DiscoverTestsError::Discovery(_)),
        "unexpected error: {err}"
    );
    assert_eq!(tree_ids(&harness), before);
    assert_eq!(harness.manager.phase(), ManagerPhase::Ready);
    Ok(())
}

#[tokio::test]
async fn first_run_discovers() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT))
        .await?;

    let launched = harness.spawner.launched();
    assert_eq!(launched.len(), 2, "one discovery and one run");
    assert!(launched[0].args.iter().any(|arg| arg == "--collect-only"));
    assert_eq!(tree_ids(&harness).len(), 10);
    Ok(())
}

#[tokio::test]
async fn mismatched_request_is_rejected() {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    let err = harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Unittest, WORKSPACE_ROOT))
        .await
        .expect_err("provider doesn't match");
    assert!(matches!(err, RunTestsError::RequestMismatch { .. }));
    assert!(harness.spawner.launched().is_empty());
}

#[tokio::test]
async fn debug_run_without_debugger() {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    let err = harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT).with_debug(true))
        .await
        .expect_err("no debugger configured");
    assert!(matches!(
        err,
        RunTestsError::NoDebugger {
            provider: TestProvider::Pytest
        }
    ));
    assert_eq!(harness.manager.phase(), ManagerPhase::Uninitialized);
}

#[tokio::test]
async fn debug_run_wraps_the_command() -> Result<()> {
    let harness = Harness::new(
        TestProvider::Pytest,
        StaticSettings {
            debugger: Some(vec!["debugpy-wrapper".to_owned(), "--wait".to_owned()]),
            ..StaticSettings::default()
        },
    );
    harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT).with_debug(true))
        .await?;

    let runs = harness.spawner.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].program, "debugpy-wrapper");
    assert_eq!(&runs[0].args[..4], ["--wait", "python3", "-m", "pytest"]);

    // Discovery isn't debugged.
    assert_eq!(harness.spawner.launched()[0].program, "python3");
    Ok(())
}
