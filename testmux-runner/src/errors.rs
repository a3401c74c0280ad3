// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testmux.

use crate::{
    helpers::plural,
    manager::ManagerPhase,
    provider::TestProvider,
    tree::{NodeKind, StableId},
};
use camino::Utf8PathBuf;
use config::ConfigError;
use itertools::Itertools;
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing a testmux config file.
#[derive(Debug, Error)]
#[error("failed to parse testmux config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
///
/// Returned by [`ConfigParseError::kind`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A root directory in the config escapes the workspace.
    #[error("root-directory `{root_directory}` for {provider} is not inside the workspace")]
    RootDirectoryOutsideWorkspace {
        /// The provider whose root directory is invalid.
        provider: TestProvider,

        /// The root directory as written.
        root_directory: Utf8PathBuf,
    },

    /// A provider's argument string could not be split into arguments.
    #[error("failed to split {provider} args `{args}` into arguments")]
    ProviderArgs {
        /// The provider whose arguments are invalid.
        provider: TestProvider,

        /// The argument string as written.
        args: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },

    /// The debugger command could not be split into arguments.
    #[error("failed to split debugger command `{command}` into arguments")]
    DebuggerCommand {
        /// The debugger command.
        command: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },
}

/// An error returned while parsing a [`TestProvider`] from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized test provider `{input}`\n(known values: {})",
    TestProvider::variants().join(", "),
)]
pub struct ProviderParseError {
    input: String,
}

impl ProviderParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while launching a test process.
///
/// This typically means that the command wasn't found or couldn't be executed. It's fatal to the
/// discovery or run attempt, and is surfaced verbatim.
#[derive(Debug, Error)]
#[error("failed to launch `{program}` in `{cwd}`")]
pub struct ProcessLaunchError {
    program: String,
    cwd: Utf8PathBuf,
    #[source]
    err: io::Error,
}

impl ProcessLaunchError {
    pub(crate) fn new(
        program: impl Into<String>,
        cwd: impl Into<Utf8PathBuf>,
        err: io::Error,
    ) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            err,
        }
    }

    /// Returns the program that failed to launch.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the kind of I/O error that occurred.
    pub fn io_kind(&self) -> io::ErrorKind {
        self.err.kind()
    }
}

/// An error that occurred while collecting tests from a test framework.
///
/// This is non-fatal: the manager keeps the last-known-good tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The discovery process exited unsuccessfully.
    #[error(
        "{provider} discovery exited with {}\n--- stderr:\n{stderr}",
        DisplayExitCode(*.exit_code)
    )]
    ProcessFailed {
        /// The provider that was discovering tests.
        provider: TestProvider,

        /// The exit code, or `None` if the process was terminated by a signal.
        exit_code: Option<i32>,

        /// Standard error produced by the process.
        stderr: String,
    },

    /// The discovery output could not be parsed.
    #[error("{provider} discovery output line {line_number} (`{line}`) is invalid: {reason}")]
    Unparsable {
        /// The provider that was discovering tests.
        provider: TestProvider,

        /// The 1-based line number within the output.
        line_number: usize,

        /// The line that failed to parse.
        line: String,

        /// The reason parsing failed.
        reason: &'static str,

        /// Standard error produced by the process.
        stderr: String,
    },

    /// The discovery output was not valid UTF-8.
    #[error("{provider} discovery output is not valid UTF-8")]
    NonUtf8Output {
        /// The provider that was discovering tests.
        provider: TestProvider,
    },

    /// Discovery did not finish within the configured timeout.
    #[error(
        "{provider} discovery did not finish within {}",
        humantime::format_duration(*.timeout)
    )]
    TimedOut {
        /// The provider that was discovering tests.
        provider: TestProvider,

        /// The timeout that was hit.
        timeout: Duration,
    },

    /// Waiting for the discovery process failed.
    #[error("error waiting for {provider} discovery process")]
    Wait {
        /// The provider that was discovering tests.
        provider: TestProvider,

        /// The underlying error.
        #[source]
        err: io::Error,
    },
}

impl DiscoveryError {
    /// Returns the standard error output of the discovery process, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ProcessFailed { stderr, .. } | Self::Unparsable { stderr, .. } => Some(stderr),
            Self::NonUtf8Output { .. } | Self::TimedOut { .. } | Self::Wait { .. } => None,
        }
    }

    /// Returns the exit code of the discovery process, if it exited unsuccessfully.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Two nodes in a discovered tree resolved to the same stable id.
///
/// This is a discovery-correctness violation, and usually indicates a misconfiguration such as
/// overlapping root directories or duplicate test names.
#[derive(Clone, Debug, Error)]
#[error("duplicate test id `{id}` (first seen as a {first_kind}, then as a {second_kind})")]
pub struct DuplicateIdError {
    id: StableId,
    first_kind: NodeKind,
    second_kind: NodeKind,
}

impl DuplicateIdError {
    pub(crate) fn new(id: StableId, first_kind: NodeKind, second_kind: NodeKind) -> Self {
        Self {
            id,
            first_kind,
            second_kind,
        }
    }

    /// Returns the duplicated id.
    pub fn id(&self) -> &StableId {
        &self.id
    }
}

/// An error returned by [`TestManager::discover_tests`](crate::manager::TestManager::discover_tests).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoverTestsError {
    /// Settings for the provider could not be read.
    #[error(transparent)]
    Settings(#[from] ConfigParseError),

    /// The discovery process could not be launched.
    #[error(transparent)]
    Launch(#[from] ProcessLaunchError),

    /// The discovery process failed or produced unparsable output.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The discovered tree contained duplicate ids.
    #[error(transparent)]
    DuplicateId(#[from] DuplicateIdError),
}

/// A result payload could not be parsed.
///
/// For batch reports, a document-level error means no outcomes at all. For streams, the offending
/// message is dropped and decoding continues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The XML document is malformed.
    #[error("malformed XUnit report at byte {position}")]
    Xml {
        /// The byte position at which the error occurred.
        position: u64,

        /// The underlying error.
        #[source]
        err: quick_xml::Error,
    },

    /// The XML document ended while elements were still open.
    #[error("XUnit report ended unexpectedly inside <{open}>")]
    UnexpectedEof {
        /// The innermost element that was still open.
        open: String,
    },

    /// The XML document doesn't have a root element.
    #[error("XUnit report has no root element")]
    NoRootElement,

    /// A required attribute was missing.
    #[error("<{element}> is missing required attribute `{attribute}`")]
    MissingAttribute {
        /// The element name.
        element: &'static str,

        /// The attribute name.
        attribute: &'static str,
    },

    /// A streamed message wasn't valid JSON or didn't match the expected shape.
    #[error("invalid result message `{line}`")]
    InvalidMessage {
        /// The line that failed to decode.
        line: String,

        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },

    /// A streamed message line exceeded the maximum length and was dropped.
    #[error("result message of {len} bytes exceeds the limit of {max} bytes")]
    LineTooLong {
        /// The length of the line seen so far.
        len: usize,

        /// The maximum line length.
        max: usize,
    },

    /// A streamed lifecycle message is missing its test id.
    #[error("`{event}` message is missing a test id")]
    MissingId {
        /// The event name.
        event: &'static str,
    },
}

/// The reason a run didn't produce terminal outcomes for every targeted test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncompleteReason {
    /// The overall run timeout elapsed.
    TimedOut,

    /// The result stream closed before the end-of-stream marker.
    StreamDisconnected,

    /// The test process never connected to the result listener.
    StreamNeverConnected,

    /// The stream ended normally but some tests were never reported.
    MissingOutcomes,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "run timed out"),
            Self::StreamDisconnected => write!(f, "result stream disconnected"),
            Self::StreamNeverConnected => write!(f, "test process never connected"),
            Self::MissingOutcomes => write!(f, "no outcome was reported"),
        }
    }
}

/// One or more targeted tests never reached a terminal status.
///
/// The affected tests are marked as errored with a "did not complete" message.
#[derive(Clone, Debug, Error)]
#[error(
    "{} {} did not complete ({reason}): {}",
    .ids.len(),
    plural::tests_str(.ids.len()),
    DisplayIds(.ids),
)]
pub struct IncompleteRunError {
    reason: IncompleteReason,
    ids: Vec<StableId>,
}

impl IncompleteRunError {
    pub(crate) fn new(reason: IncompleteReason, ids: Vec<StableId>) -> Self {
        Self { reason, ids }
    }

    /// Returns the reason the run was incomplete.
    pub fn reason(&self) -> IncompleteReason {
        self.reason
    }

    /// Returns the ids of the tests that did not complete.
    pub fn ids(&self) -> &[StableId] {
        &self.ids
    }
}

/// A run was requested while the manager was busy.
///
/// At most one run (or discovery) is active per manager. The in-flight operation is unaffected.
#[derive(Clone, Debug, Error)]
#[error("cannot run {provider} tests in `{workspace_root}`: manager is {phase}")]
pub struct ConcurrentRunError {
    workspace_root: Utf8PathBuf,
    provider: TestProvider,
    phase: ManagerPhase,
}

impl ConcurrentRunError {
    pub(crate) fn new(
        workspace_root: impl Into<Utf8PathBuf>,
        provider: TestProvider,
        phase: ManagerPhase,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            provider,
            phase,
        }
    }

    /// Returns the phase the manager was in when the run was rejected.
    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }
}

/// An error that occurred while preparing a test run, before any results could be produced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerSetupError {
    /// The test process could not be launched.
    #[error(transparent)]
    Launch(#[from] ProcessLaunchError),

    /// The result listener could not be bound.
    #[error("failed to bind result listener on loopback")]
    BindListener(#[source] io::Error),

    /// The file describing tests to run could not be written.
    #[error("failed to write run targets file")]
    TargetsFile(#[source] io::Error),

    /// A temporary location for the batch report could not be created.
    #[error("failed to create temporary directory for the XUnit report")]
    ReportDir(#[source] io::Error),
}

/// An error returned by [`TestManager::run_tests`](crate::manager::TestManager::run_tests).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunTestsError {
    /// Settings for the provider could not be read.
    #[error(transparent)]
    Settings(#[from] ConfigParseError),

    /// Another run or discovery is in progress on this manager.
    #[error(transparent)]
    Concurrent(#[from] ConcurrentRunError),

    /// Tests had to be discovered before running, and discovery failed.
    #[error("failed to discover tests before running")]
    Discovery(#[source] DiscoverTestsError),

    /// The run could not be started.
    #[error("failed to start test run")]
    Setup(#[source] RunnerSetupError),

    /// A debug run was requested but no debugger is configured.
    #[error("debug run requested for {provider}, but no debugger is configured")]
    NoDebugger {
        /// The provider the run was requested for.
        provider: TestProvider,
    },

    /// The run request was addressed to a different workspace or provider.
    #[error(
        "run request for {request_provider} in `{request_root}` sent to the {provider} manager for `{workspace_root}`"
    )]
    RequestMismatch {
        /// The manager's provider.
        provider: TestProvider,

        /// The manager's workspace root.
        workspace_root: Utf8PathBuf,

        /// The provider named by the request.
        request_provider: TestProvider,

        /// The workspace root named by the request.
        request_root: Utf8PathBuf,
    },
}

/// An error returned while looking up a test manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerLookupError {
    /// Settings for the workspace could not be read.
    #[error(transparent)]
    Settings(#[from] ConfigParseError),

    /// The provider is disabled for this workspace.
    #[error("{provider} is not enabled for `{workspace_root}`")]
    ProviderDisabled {
        /// The workspace root.
        workspace_root: Utf8PathBuf,

        /// The disabled provider.
        provider: TestProvider,
    },
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// Lists ids, eliding past a handful.
struct DisplayIds<'a>(&'a [StableId]);

impl DisplayIds<'_> {
    const MAX_SHOWN: usize = 5;
}

impl fmt::Display for DisplayIds<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().take(Self::MAX_SHOWN).join(", "))?;
        if self.0.len() > Self::MAX_SHOWN {
            write!(f, " and {} more", self.0.len() - Self::MAX_SHOWN)?;
        }
        Ok(())
    }
}

struct DisplayExitCode(Option<i32>);

impl fmt::Display for DisplayExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "no exit code (terminated by signal)"),
        }
    }
}
