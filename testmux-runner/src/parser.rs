// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsers that turn framework results into [`TestOutcome`]s.
//!
//! * [`xunit`] reads the XML report pytest writes after a batch run.
//! * [`socket`] decodes the newline-delimited JSON stream sent by the unittest run script.

pub mod socket;
pub mod xunit;

use crate::tree::{StableId, TestStatus};
use std::time::Duration;

/// A result (or a progress update) for one test, from one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestOutcome {
    /// The stable id of the test.
    pub id: StableId,

    /// The reported status: [`TestStatus::Running`] for a start notification, otherwise a
    /// terminal status.
    pub status: TestStatus,

    /// How long the test took, if reported.
    pub duration: Option<Duration>,

    /// The failure, error or skip message.
    pub message: Option<String>,

    /// The traceback, if one was reported.
    pub traceback: Option<String>,

    /// The 1-based line the test is defined at, if reported.
    pub line: Option<u32>,
}

impl TestOutcome {
    /// Creates a new outcome with no metadata.
    pub fn new(id: StableId, status: TestStatus) -> Self {
        Self {
            id,
            status,
            duration: None,
            message: None,
            traceback: None,
            line: None,
        }
    }

    /// Returns true if this is a terminal result rather than a progress update.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Converts a duration in seconds, as reported by frameworks, into a [`Duration`].
///
/// Negative, infinite and NaN values are dropped.
pub(crate) fn duration_from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
