// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events published by test managers.
//!
//! Every change to a manager's tree is published as a [`ManagerEvent::TreeMutated`], and every
//! run that started ends with exactly one [`ManagerEvent::RunCompleted`]. Events are serializable
//! so that they can be forwarded to UI clients as-is.

use crate::{
    provider::TestProvider,
    runner::{ProcessError, RunId, RunnerState},
    tree::{StableId, TestStatus},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::time::Duration;

/// An event published by a [`TestManager`](crate::manager::TestManager).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManagerEvent {
    /// Nodes in the tree changed status.
    TreeMutated(TreeMutation),

    /// A run reached a terminal state.
    RunCompleted(RunCompletion),
}

impl ManagerEvent {
    /// Returns the workspace root this event is for.
    pub fn workspace_root(&self) -> &Utf8PathBuf {
        match self {
            Self::TreeMutated(mutation) => &mutation.workspace_root,
            Self::RunCompleted(completion) => &completion.workspace_root,
        }
    }

    /// Returns the provider this event is for.
    pub fn provider(&self) -> TestProvider {
        match self {
            Self::TreeMutated(mutation) => mutation.provider,
            Self::RunCompleted(completion) => completion.provider,
        }
    }
}

/// Why a tree changed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationCause {
    /// Tests were (re)discovered and the tree was replaced.
    Discovery,

    /// Results were cleared ahead of a run.
    Reset,

    /// Results arrived from a run.
    Results,

    /// Tests that never reported were settled at the end of a run.
    Settled,
}

/// A change to the statuses in a tree.
#[derive(Clone, Debug, Serialize)]
pub struct TreeMutation {
    /// The workspace root.
    pub workspace_root: Utf8PathBuf,

    /// The provider whose tree changed.
    pub provider: TestProvider,

    /// The run that caused the change, if any.
    pub run_id: Option<RunId>,

    /// What caused the change.
    pub cause: MutationCause,

    /// Every node whose status (or results) may have changed.
    pub affected: Vec<StableId>,

    /// The root status after the change.
    pub root_status: TestStatus,
}

/// Counts of leaf results in a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunStats {
    /// Tests that passed.
    pub passed: usize,

    /// Tests that failed.
    pub failed: usize,

    /// Tests that were skipped.
    pub skipped: usize,

    /// Tests that errored, including ones that did not complete.
    pub errored: usize,

    /// Tests that were targeted but never ran.
    pub not_run: usize,
}

impl RunStats {
    /// Records one leaf with the given final status.
    pub fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail => self.failed += 1,
            TestStatus::Skip => self.skipped += 1,
            TestStatus::Error => self.errored += 1,
            TestStatus::NotRun
            | TestStatus::Discovered
            | TestStatus::Running
            | TestStatus::Idle => self.not_run += 1,
        }
    }

    /// Returns the total number of tests counted.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.errored + self.not_run
    }

    /// Returns true if nothing failed or errored.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

/// The terminal record of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunCompletion {
    /// The workspace root.
    pub workspace_root: Utf8PathBuf,

    /// The provider that ran.
    pub provider: TestProvider,

    /// The run id.
    pub run_id: RunId,

    /// The terminal state of the run.
    pub state: RunnerState,

    /// True if the run was cancelled by the run timeout.
    pub timed_out: bool,

    /// Counts of results among the targeted tests.
    pub stats: RunStats,

    /// The number of targeted tests that never reached a terminal status.
    pub incomplete: usize,

    /// Set if the test process exited unclean.
    pub process_error: Option<ProcessError>,

    /// The root status once the run was settled.
    pub root_status: TestStatus,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}
