// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test providers: the frameworks testmux knows how to drive.
//!
//! Each [`TestProvider`] variant supplies everything that differs between frameworks: how tests
//! are collected and how the collection output is parsed, how user arguments are filtered, how a
//! run is launched, and how results come back (see [`IngestionKind`]).

mod pytest;
mod unittest;

use crate::{
    args::ArgsMode,
    config::ProviderSettings,
    errors::ProviderParseError,
    process::ProcessSpec,
    tree::DiscoveredTest,
};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The exit code both frameworks use when a run finished with failing tests.
const TESTS_FAILED: i32 = 1;

/// A test framework.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestProvider {
    /// pytest.
    Pytest,

    /// The standard library's unittest.
    Unittest,
}

impl TestProvider {
    /// All providers, in preference order.
    pub const ALL: [Self; 2] = [Self::Pytest, Self::Unittest];

    /// Returns the string forms of all providers.
    pub fn variants() -> [&'static str; 2] {
        [Self::Pytest.as_str(), Self::Unittest.as_str()]
    }

    /// Returns the string form of this provider.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pytest => "pytest",
            Self::Unittest => "unittest",
        }
    }

    /// Returns how results are reported by this provider's test processes.
    pub fn ingestion(self) -> IngestionKind {
        match self {
            Self::Pytest => IngestionKind::Batch,
            Self::Unittest => IngestionKind::Streaming,
        }
    }

    /// Builds the framework arguments for `mode` from the configured user arguments.
    ///
    /// For pytest in run mode, `subset` lists the native ids of the tests to run; user-supplied
    /// test paths are dropped in that case. Unittest passes its selection out of band, so
    /// `subset` is ignored.
    pub fn build_args(
        self,
        user_args: &[String],
        mode: ArgsMode,
        subset: Option<&[String]>,
    ) -> Vec<String> {
        match self {
            Self::Pytest => pytest::build_args(user_args, mode, subset),
            Self::Unittest => unittest::build_args(user_args),
        }
    }

    /// Returns the command that collects tests without running them.
    pub fn discovery_spec(self, settings: &ProviderSettings) -> ProcessSpec {
        let args = self.build_args(&settings.args, ArgsMode::Discover, None);
        match self {
            Self::Pytest => pytest::discovery_spec(settings, args),
            Self::Unittest => unittest::discovery_spec(settings, args),
        }
    }

    /// Parses the standard output of a successful discovery process.
    pub fn parse_discovery_output(
        self,
        output: &str,
    ) -> Result<Vec<DiscoveredTest>, UnparsableLine> {
        match self {
            Self::Pytest => pytest::parse_collection(output),
            Self::Unittest => unittest::parse_collection(output),
        }
    }

    /// Returns true if a discovery exit code means "no tests were found" rather than a failure.
    pub fn is_empty_collection(self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Pytest => exit_code == Some(pytest::NO_TESTS_COLLECTED),
            Self::Unittest => false,
        }
    }

    /// Returns true if a run exit code indicates the framework ran cleanly, even if it's
    /// non-zero.
    ///
    /// Both frameworks exit with 1 when tests fail, which is a clean run.
    pub fn is_clean_exit(self, exit_code: Option<i32>) -> bool {
        matches!(exit_code, Some(0 | TESTS_FAILED)) || self.is_empty_collection(exit_code)
    }

    /// Returns the command that runs tests, reporting results over `channel`.
    pub(crate) fn run_spec(
        self,
        settings: &ProviderSettings,
        args: Vec<String>,
        channel: &ResultChannel<'_>,
    ) -> ProcessSpec {
        match self {
            Self::Pytest => pytest::run_spec(settings, args, channel),
            Self::Unittest => unittest::run_spec(settings, args, channel),
        }
    }
}

impl fmt::Display for TestProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestProvider {
    type Err = ProviderParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == s)
            .ok_or_else(|| ProviderParseError::new(s))
    }
}

/// How a provider's test processes report results.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionKind {
    /// An XUnit XML report, read after the process exits.
    Batch,

    /// Newline-delimited JSON messages over a loopback socket, read as the process runs.
    Streaming,
}

impl IngestionKind {
    /// Returns the string form of this ingestion kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for IngestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a test process sends its results.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ResultChannel<'a> {
    /// An XUnit report written to `path`.
    Report { path: &'a Utf8Path },

    /// A loopback socket on `port`, with the tests to run listed in `targets_file`.
    Socket { port: u16, targets_file: &'a Utf8Path },
}

/// A line of discovery output that couldn't be parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnparsableLine {
    /// The 1-based line number.
    pub line_number: usize,

    /// The line's contents.
    pub line: String,

    /// Why the line couldn't be parsed.
    pub reason: &'static str,
}
