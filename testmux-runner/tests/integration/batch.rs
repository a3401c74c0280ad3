// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! pytest runs, with results read from an XUnit report after the process exits.

use crate::fixtures::{Harness, StaticSettings, WORKSPACE_ROOT, exited};
use color_eyre::eyre::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use testmux_runner::{
    manager::RunRequest,
    provider::TestProvider,
    runner::RunnerState,
    tree::{StableId, TestStatus},
};

const FULL_REPORT: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <testsuites>
      <testsuite name="pytest" errors="1" failures="1" skipped="1" tests="5" time="0.12">
        <testcase classname="tests.test_math" name="test_add" file="tests/test_math.py" line="2" time="0.001" />
        <testcase classname="tests.test_math.TestDivide" name="test_by_one" file="tests/test_math.py" line="8" time="0.002" />
        <testcase classname="tests.test_math.TestDivide" name="test_by_zero" file="tests/test_math.py" line="11" time="0.003">
          <failure message="ZeroDivisionError: division by zero">def test_by_zero():
    &gt;   1 / 0
    E   ZeroDivisionError: division by zero</failure>
        </testcase>
        <testcase classname="tests.test_strings" name="test_upper[a-A]" file="tests/test_strings.py" line="4" time="0.000">
          <skipped type="pytest.skip" message="not today" />
        </testcase>
        <testcase classname="tests.test_strings" name="test_upper[b-B]" file="tests/test_strings.py" line="4" time="0.001">
          <error message="fixture 'letters' not found" />
        </testcase>
      </testsuite>
    </testsuites>
"#};

#[tokio::test]
async fn full_run_applies_report() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        run.write_report(FULL_REPORT).await;
        exited(1)
    });

    let summary = harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT))
        .await?;

    assert_eq!(summary.state, RunnerState::Completed);
    assert!(summary.process_error.is_none(), "test failures are not a process error");
    assert!(summary.incomplete.is_none());
    assert_eq!(
        (
            summary.stats.passed,
            summary.stats.failed,
            summary.stats.skipped,
            summary.stats.errored,
            summary.stats.not_run,
        ),
        (2, 1, 1, 1, 0)
    );

    assert_eq!(harness.status("tests/test_math.py::test_add"), TestStatus::Pass);
    assert_eq!(
        harness.status("tests/test_math.py::TestDivide::test_by_zero"),
        TestStatus::Fail
    );
    assert_eq!(
        harness.message("tests/test_math.py::TestDivide::test_by_zero").as_deref(),
        Some("ZeroDivisionError: division by zero")
    );
    assert_eq!(
        harness.status("tests/test_strings.py::test_upper[a-A]"),
        TestStatus::Skip
    );
    assert_eq!(
        harness.status("tests/test_strings.py::test_upper[b-B]"),
        TestStatus::Error
    );

    // Parents take the worst status of their children.
    assert_eq!(
        harness.status("tests/test_math.py::TestDivide"),
        TestStatus::Fail
    );
    assert_eq!(harness.status("tests/test_math.py"), TestStatus::Fail);
    assert_eq!(harness.status("tests"), TestStatus::Error);
    assert_eq!(harness.status(StableId::ROOT), TestStatus::Error);

    // XUnit lines are zero-based.
    let line = harness.manager.with_tree(|tree, index| {
        let node = index.get(&StableId::new("tests/test_math.py::test_add"))?;
        tree.node(node).line()
    });
    assert_eq!(line, Some(Some(3)));

    let runs = harness.spawner.runs();
    assert_eq!(runs.len(), 1);
    assert!(
        runs[0].args.iter().all(|arg| !arg.contains("::")),
        "a full run doesn't list node ids: {:?}",
        runs[0].args
    );
    Ok(())
}

#[tokio::test]
async fn empty_report_leaves_tests_not_run() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        run.write_report(r#"<testsuites><testsuite name="pytest" tests="0" /></testsuites>"#)
            .await;
        exited(5)
    });

    let summary = harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT))
        .await?;

    assert_eq!(summary.state, RunnerState::Completed);
    assert!(summary.process_error.is_none());
    assert!(summary.incomplete.is_none(), "batch runs don't settle as errors");
    assert_eq!(summary.stats.not_run, 5);
    assert_eq!(harness.status(StableId::ROOT), TestStatus::NotRun);
    Ok(())
}

#[tokio::test]
async fn partial_run_keeps_other_results() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.spawner.on_run(|run| async move {
        run.write_report(FULL_REPORT).await;
        exited(1)
    });
    harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT))
        .await?;

    harness.spawner.on_run(|run| async move {
        run.write_report(indoc! {r#"
            <testsuites>
              <testsuite name="pytest" tests="1">
                <testcase classname="tests.test_math.TestDivide" name="test_by_zero" file="tests/test_math.py" line="11" time="0.001" />
              </testsuite>
            </testsuites>
        "#})
        .await;
        exited(0)
    });
    let summary = harness
        .manager
        .run_tests(
            RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT)
                .with_subset([StableId::new("tests/test_math.py::TestDivide::test_by_zero")]),
        )
        .await?;

    assert_eq!(summary.stats.total(), 1);
    assert_eq!(summary.stats.passed, 1);
    assert_eq!(
        harness.status("tests/test_math.py::TestDivide::test_by_zero"),
        TestStatus::Pass
    );
    assert_eq!(
        harness.message("tests/test_math.py::TestDivide::test_by_zero"),
        None,
        "the previous failure message was reset"
    );
    assert_eq!(
        harness.status("tests/test_strings.py::test_upper[b-B]"),
        TestStatus::Error,
        "tests outside the subset keep their results"
    );
    assert_eq!(harness.status("tests/test_math.py"), TestStatus::Pass);

    let runs = harness.spawner.runs();
    let node_ids: Vec<&str> = runs[1]
        .args
        .iter()
        .filter(|arg| arg.contains("::"))
        .map(String::as_str)
        .collect();
    assert_eq!(node_ids, ["tests/test_math.py::TestDivide::test_by_zero"]);
    Ok(())
}

#[tokio::test]
async fn subset_of_a_suite_runs_its_leaves() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    let summary = harness
        .manager
        .run_tests(
            RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT)
                .with_subset([StableId::new("tests/test_math.py::TestDivide")]),
        )
        .await?;

    // No report was written, so both targeted tests revert to not run.
    assert_eq!(summary.stats.not_run, 2);
    assert_eq!(summary.stats.total(), 2);
    Ok(())
}

#[tokio::test]
async fn crash_without_results_fails_the_run() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.spawner.on_run(|_| async {
        let mut output = exited(3);
        output.stderr = "INTERNALERROR> boom".into();
        output
    });

    let summary = harness
        .manager
        .run_tests(RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT))
        .await?;

    assert_eq!(summary.state, RunnerState::Failed);
    let process_error = summary.process_error.expect("unclean exit is reported");
    assert_eq!(process_error.exit_code, Some(3));
    assert!(process_error.stderr.contains("INTERNALERROR"));
    assert_eq!(harness.status(StableId::ROOT), TestStatus::NotRun);
    Ok(())
}

#[tokio::test]
async fn args_override_replaces_configured_args() -> Result<()> {
    let harness = Harness::new(TestProvider::Pytest, StaticSettings::default());
    harness.manager.discover_tests().await?;
    harness
        .manager
        .run_tests(
            RunRequest::all(TestProvider::Pytest, WORKSPACE_ROOT)
                .with_args_override(vec!["-k".to_owned(), "smoke".to_owned()]),
        )
        .await?;

    let runs = harness.spawner.runs();
    let args = &runs[0].args;
    let k = args.iter().position(|arg| arg == "-k").expect("-k passed through");
    assert_eq!(args[k + 1], "smoke");
    Ok(())
}
