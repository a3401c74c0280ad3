// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use std::{error::Error, io, path::PathBuf};
use testmux_runner::{errors::*, provider::TestProvider};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Process exit codes returned by testmux.
#[doc(hidden)]
pub enum TestmuxExitCode {}

impl TestmuxExitCode {
    /// No tests were selected to run.
    pub const NO_TESTS_RUN: i32 = 4;

    /// An error occurred while setting up the command: config, workspace, or runtime.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed, errored, or didn't complete.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Discovering tests failed.
    pub const DISCOVERY_FAILED: i32 = 104;

    /// Writing output failed.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}

// The #[error()] strings are placeholders: errors are printed with display_to_stderr, which
// colorizes them and prints the source chain.

/// An error that testmux knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("failed to determine the current directory")]
    CurrentDir {
        #[source]
        err: io::Error,
    },
    #[error("workspace root is not valid UTF-8")]
    WorkspaceRootInvalidUtf8 { path: PathBuf },
    #[error("failed to parse log directives")]
    LogFilterParse {
        value: String,
        #[source]
        err: tracing_subscriber::filter::ParseError,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("manager lookup error")]
    ManagerLookup {
        #[from]
        err: ManagerLookupError,
    },
    #[error("no providers enabled")]
    NoProvidersEnabled { workspace_root: Utf8PathBuf },
    #[error("discovery failed")]
    Discovery {
        provider: TestProvider,
        #[source]
        err: DiscoverTestsError,
    },
    #[error("run failed")]
    RunTests {
        provider: TestProvider,
        #[source]
        err: RunTestsError,
    },
    #[error("failed to create tokio runtime")]
    TokioRuntimeCreate {
        #[source]
        err: io::Error,
    },
    #[error("signal handler setup error")]
    SignalHandlerSetup {
        #[from]
        err: SignalHandlerSetupError,
    },
    #[error("error writing output")]
    WriteOutput {
        #[source]
        err: io::Error,
    },
    #[error("error serializing output")]
    SerializeOutput {
        #[source]
        err: serde_json::Error,
    },
    #[error("test run failed")]
    TestRunFailed,
    #[error("no tests to run")]
    NoTestsRun,
}

impl ExpectedError {
    pub(crate) fn discovery(provider: TestProvider, err: DiscoverTestsError) -> Self {
        Self::Discovery { provider, err }
    }

    pub(crate) fn run_tests(provider: TestProvider, err: RunTestsError) -> Self {
        Self::RunTests { provider, err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDir { .. }
            | Self::WorkspaceRootInvalidUtf8 { .. }
            | Self::LogFilterParse { .. }
            | Self::ConfigParseError { .. }
            | Self::ManagerLookup { .. }
            | Self::NoProvidersEnabled { .. }
            | Self::TokioRuntimeCreate { .. }
            | Self::SignalHandlerSetup { .. } => TestmuxExitCode::SETUP_ERROR,
            Self::Discovery { .. } => TestmuxExitCode::DISCOVERY_FAILED,
            Self::RunTests { err, .. } => match err {
                RunTestsError::Discovery(_) => TestmuxExitCode::DISCOVERY_FAILED,
                _ => TestmuxExitCode::SETUP_ERROR,
            },
            Self::WriteOutput { .. } | Self::SerializeOutput { .. } => {
                TestmuxExitCode::WRITE_OUTPUT_ERROR
            }
            Self::TestRunFailed => TestmuxExitCode::TEST_RUN_FAILED,
            Self::NoTestsRun => TestmuxExitCode::NO_TESTS_RUN,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDir { err } => {
                error!("failed to determine the current directory");
                Some(err as &dyn Error)
            }
            Self::WorkspaceRootInvalidUtf8 { path } => {
                error!(
                    "workspace root `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::LogFilterParse { value, err } => {
                error!(
                    "failed to parse log directives `{}`",
                    value.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!("{err}");
                err.source()
            }
            Self::ManagerLookup { err } => {
                error!("{err}");
                err.source()
            }
            Self::NoProvidersEnabled { workspace_root } => {
                error!(
                    "no test providers are enabled for `{}`",
                    workspace_root.style(styles.bold)
                );
                None
            }
            Self::Discovery { provider, err } => {
                error!("{}: failed to discover tests", provider.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::RunTests { provider, err } => {
                error!("{}: failed to run tests", provider.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::TokioRuntimeCreate { err } => {
                error!("failed to create tokio runtime");
                Some(err as &dyn Error)
            }
            Self::SignalHandlerSetup { err } => {
                error!("error setting up signal handler");
                Some(err as &dyn Error)
            }
            Self::WriteOutput { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
            Self::SerializeOutput { err } => {
                error!("error serializing output");
                Some(err as &dyn Error)
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
            Self::NoTestsRun => {
                error!(
                    "{}",
                    "no tests to run".style(styles.warning_text)
                );
                None
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
