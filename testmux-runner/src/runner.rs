// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! A [`TestRunner`] executes a single run: it launches the provider's test process, ingests
//! results as they arrive (or once the process exits, for batch providers), and classifies the
//! run into a terminal [`RunnerState`].
//!
//! The runner never touches the test tree. Outcomes are forwarded over a channel as
//! [`RunnerEvent`]s, and the caller applies them.

use crate::{
    args::ArgsMode,
    config::ProviderSettings,
    errors::RunnerSetupError,
    parser::{
        TestOutcome,
        socket::{ResultListener, StreamEnd, StreamIngest},
        xunit,
    },
    process::{ChildHandle, DebugLauncher, ProcessOutput, ProcessSpawner},
    provider::{IngestionKind, ResultChannel},
    stopwatch::stopwatch,
    tree::StableId,
};
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::{fmt, io, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The environment variable a test process finds its run id in.
pub const RUN_ID_ENV: &str = "TESTMUX_RUN_ID";

/// The environment variable a streaming test process finds its result port in.
pub const RESULT_PORT_ENV: &str = "TESTMUX_RESULT_PORT";

/// How long a streaming process gets to finish sending results after it exits.
pub const DEFAULT_CONNECT_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for a killed process's output.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A unique identifier for a run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new, random run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The lifecycle of a single run.
///
/// `Idle -> Spawning -> Streaming -> Completed | Cancelled | Failed`. The last three are
/// terminal; a runner never leaves a terminal state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerState {
    /// The run hasn't started.
    Idle,

    /// The test process is being launched.
    Spawning,

    /// The test process is running and results are being read.
    Streaming,

    /// The test process exited and results were ingested.
    Completed,

    /// The run was stopped, or timed out.
    Cancelled,

    /// The run could not produce results.
    Failed,
}

impl RunnerState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns the string form of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handle used to stop a run, and to wait for it to wind down.
///
/// Cloning a handle produces another handle to the same run.
#[derive(Clone, Debug)]
pub struct RunStopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug)]
struct StopInner {
    stop: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

impl Default for RunStopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStopHandle {
    /// Creates a new handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stop: watch::Sender::new(false),
                finished: watch::Sender::new(false),
            }),
        }
    }

    /// Requests that the run stop. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Returns true if a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Waits until the run has fully wound down.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = rx.wait_for(|finished| *finished).await;
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.send_replace(true);
    }

    async fn stopped(&self) {
        let mut rx = self.inner.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// A test to run: its stable id, and the id its framework uses to select it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RunTarget {
    /// The stable id.
    pub id: StableId,

    /// The framework's id for the test.
    #[serde(rename = "native")]
    pub native_id: String,
}

/// Everything needed to launch one run.
#[derive(Clone, Debug)]
pub struct RunInvocation {
    /// The run id.
    pub run_id: RunId,

    /// Settings for the provider being run.
    pub settings: ProviderSettings,

    /// The tests to run.
    pub targets: Vec<RunTarget>,

    /// If true, every test under the root directory is run and `targets` isn't passed to the
    /// framework as a selection.
    pub run_all: bool,

    /// If set, the test process is launched under this debugger.
    pub debug_launcher: Option<Arc<dyn DebugLauncher>>,
}

/// An event produced by a [`TestRunner`] while it executes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunnerEvent {
    /// The test process was launched.
    Spawned {
        /// The OS process id, if known.
        pid: Option<u32>,
    },

    /// A test started or finished.
    Outcome(TestOutcome),
}

/// A non-clean exit of a test process, reported alongside a run's results.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProcessError {
    /// The exit code, or `None` if the process was terminated by a signal (or couldn't be
    /// waited for).
    pub exit_code: Option<i32>,

    /// Standard error produced by the process.
    pub stderr: String,
}

/// The final report of a run, returned by [`TestRunner::execute`].
#[derive(Clone, Debug)]
pub struct RunnerReport {
    /// The run id.
    pub run_id: RunId,

    /// The terminal state of the run.
    pub state: RunnerState,

    /// True if the run was cancelled because it hit the run timeout.
    pub timed_out: bool,

    /// For streaming runs, how the result stream ended.
    pub stream_end: Option<StreamEnd>,

    /// Set if the test process exited unclean.
    pub process_error: Option<ProcessError>,

    /// The number of terminal outcomes received.
    pub terminal_outcomes: usize,

    /// The number of result messages (or reports) that couldn't be parsed.
    pub parse_errors: usize,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took.
    pub elapsed: Duration,
}

/// Builds a [`TestRunner`].
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    connect_grace: Option<Duration>,
    stop_handle: Option<RunStopHandle>,
}

impl TestRunnerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a streaming process has to finish sending results after it exits.
    pub fn set_connect_grace(&mut self, connect_grace: Duration) -> &mut Self {
        self.connect_grace = Some(connect_grace);
        self
    }

    /// Uses `handle` to stop the run, instead of a fresh one.
    pub fn set_stop_handle(&mut self, handle: RunStopHandle) -> &mut Self {
        self.stop_handle = Some(handle);
        self
    }

    /// Creates a new test runner.
    pub fn build(&self, spawner: Arc<dyn ProcessSpawner>) -> TestRunner {
        TestRunner {
            spawner,
            connect_grace: self.connect_grace.unwrap_or(DEFAULT_CONNECT_GRACE),
            stop_handle: self.stop_handle.clone().unwrap_or_default(),
            state: RunnerState::Idle,
        }
    }
}

/// Executes a single run.
#[derive(Debug)]
pub struct TestRunner {
    spawner: Arc<dyn ProcessSpawner>,
    connect_grace: Duration,
    stop_handle: RunStopHandle,
    state: RunnerState,
}

/// Where a run's results come back.
enum PreparedChannel {
    Report {
        // Held so the directory outlives the run.
        _dir: Utf8TempDir,
        path: Utf8PathBuf,
    },
    Socket {
        _dir: Utf8TempDir,
        listener: ResultListener,
        port: u16,
        targets_file: Utf8PathBuf,
    },
}

/// What the run's I/O produced, accumulated as it goes so that a cancelled run still knows how
/// far it got.
#[derive(Debug, Default)]
struct Tally {
    terminal_outcomes: usize,
    parse_errors: usize,
    stream_end: Option<StreamEnd>,
}

enum Finish {
    Exited(io::Result<ProcessOutput>),
    Stopped,
    TimedOut,
}

impl TestRunner {
    /// Returns a handle that can be used to stop this run.
    pub fn stop_handle(&self) -> RunStopHandle {
        self.stop_handle.clone()
    }

    /// Returns the current state of the runner.
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Executes the run, sending events to `sink` as they happen.
    ///
    /// Returns an error only if the run couldn't be started. Every run that started produces a
    /// report, whatever happened to the test process.
    pub async fn execute(
        mut self,
        invocation: RunInvocation,
        sink: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<RunnerReport, RunnerSetupError> {
        let RunInvocation {
            run_id,
            settings,
            targets,
            run_all,
            debug_launcher,
        } = invocation;
        let provider = settings.provider;
        let stopwatch = stopwatch();

        self.transition(run_id, RunnerState::Spawning);
        let channel = match prepare_channel(provider.ingestion(), &targets).await {
            Ok(channel) => channel,
            Err(err) => {
                self.transition(run_id, RunnerState::Failed);
                return Err(err);
            }
        };

        let natives: Vec<String> = targets.iter().map(|t| t.native_id.clone()).collect();
        let subset = (!run_all).then_some(natives.as_slice());
        let args = provider.build_args(&settings.args, ArgsMode::Run, subset);
        let mut spec = match &channel {
            PreparedChannel::Report { path, .. } => {
                provider.run_spec(&settings, args, &ResultChannel::Report { path })
            }
            PreparedChannel::Socket {
                port, targets_file, ..
            } => {
                let mut spec = provider.run_spec(
                    &settings,
                    args,
                    &ResultChannel::Socket {
                        port: *port,
                        targets_file,
                    },
                );
                spec.env(RESULT_PORT_ENV, port.to_string());
                spec
            }
        };
        spec.env(RUN_ID_ENV, run_id.to_string());

        debug!(%run_id, "{provider}: running `{}`", spec.display_command());
        let spawned = match &debug_launcher {
            Some(launcher) => launcher.launch_under_debugger(&*self.spawner, &spec),
            None => self.spawner.spawn(&spec),
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                self.transition(run_id, RunnerState::Failed);
                return Err(err.into());
            }
        };
        let _ = sink.send(RunnerEvent::Spawned { pid: child.id() });
        self.transition(run_id, RunnerState::Streaming);

        let mut tally = Tally::default();
        let finish = {
            let work = run_to_exit(&mut *child, channel, &sink, &mut tally, self.connect_grace);
            tokio::select! {
                biased;

                () = self.stop_handle.stopped() => Finish::Stopped,
                () = tokio::time::sleep(settings.run_timeout) => Finish::TimedOut,
                exit = work => Finish::Exited(exit),
            }
        };

        let (state, timed_out, process_error) = match finish {
            Finish::Stopped | Finish::TimedOut => {
                let timed_out = matches!(finish, Finish::TimedOut);
                if timed_out {
                    warn!(
                        %run_id,
                        "{provider}: run did not finish within {}, terminating",
                        humantime::format_duration(settings.run_timeout),
                    );
                } else {
                    info!(%run_id, "{provider}: stopping run");
                }
                child.kill().await;
                if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
                    warn!(%run_id, "{provider}: test process did not exit after being killed");
                }
                (RunnerState::Cancelled, timed_out, None)
            }
            Finish::Exited(exit) => {
                let (exit_code, stderr) = match exit {
                    Ok(output) => (output.exit_code, output.stderr_lossy()),
                    Err(err) => (None, format!("error waiting for test process: {err}")),
                };
                if provider.is_clean_exit(exit_code) {
                    (RunnerState::Completed, false, None)
                } else {
                    let error = ProcessError { exit_code, stderr };
                    if tally.terminal_outcomes > 0 {
                        (RunnerState::Completed, false, Some(error))
                    } else {
                        (RunnerState::Failed, false, Some(error))
                    }
                }
            }
        };
        self.transition(run_id, state);

        let snapshot = stopwatch.snapshot();
        Ok(RunnerReport {
            run_id,
            state,
            timed_out,
            stream_end: tally.stream_end,
            process_error,
            terminal_outcomes: tally.terminal_outcomes,
            parse_errors: tally.parse_errors,
            start_time: snapshot.start_time.fixed_offset(),
            elapsed: snapshot.duration,
        })
    }

    fn transition(&mut self, run_id: RunId, to: RunnerState) {
        debug!(%run_id, "runner: {} -> {to}", self.state);
        self.state = to;
    }
}

async fn prepare_channel(
    ingestion: IngestionKind,
    targets: &[RunTarget],
) -> Result<PreparedChannel, RunnerSetupError> {
    let dir = camino_tempfile::Builder::new()
        .prefix("testmux-run-")
        .tempdir()
        .map_err(RunnerSetupError::ReportDir)?;

    match ingestion {
        IngestionKind::Batch => {
            let path = dir.path().join("report.xml");
            Ok(PreparedChannel::Report { _dir: dir, path })
        }
        IngestionKind::Streaming => {
            let targets_file = dir.path().join("targets.json");
            let contents = serde_json::to_vec(targets)
                .map_err(|err| RunnerSetupError::TargetsFile(err.into()))?;
            tokio::fs::write(&targets_file, contents)
                .await
                .map_err(RunnerSetupError::TargetsFile)?;
            let listener = ResultListener::bind()
                .await
                .map_err(RunnerSetupError::BindListener)?;
            let port = listener.port();
            Ok(PreparedChannel::Socket {
                _dir: dir,
                listener,
                port,
                targets_file,
            })
        }
    }
}

/// Drives the run until the process has exited and its results are in.
///
/// Outcomes are forwarded as they're read, and `tally` is updated as it goes, so dropping this
/// future partway through loses nothing already received.
async fn run_to_exit(
    child: &mut dyn ChildHandle,
    channel: PreparedChannel,
    sink: &mpsc::UnboundedSender<RunnerEvent>,
    tally: &mut Tally,
    connect_grace: Duration,
) -> io::Result<ProcessOutput> {
    match channel {
        PreparedChannel::Report { _dir, path } => {
            let exit = child.wait().await;
            match tokio::fs::read_to_string(&path).await {
                Ok(xml) => match xunit::parse(&xml) {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            if outcome.is_terminal() {
                                tally.terminal_outcomes += 1;
                            }
                            let _ = sink.send(RunnerEvent::Outcome(outcome));
                        }
                    }
                    Err(err) => {
                        tally.parse_errors += 1;
                        warn!("failed to parse XUnit report at {path}: {err}");
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("no XUnit report written at {path}");
                }
                Err(err) => {
                    warn!("failed to read XUnit report at {path}: {err}");
                }
            }
            exit
        }
        PreparedChannel::Socket { _dir, listener, .. } => {
            let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TestOutcome>();
            let mut ingest = StreamIngest::new();

            // Forward outcomes as they arrive, while the ingest runs alongside the process.
            let forward = async {
                while let Some(outcome) = outcome_rx.recv().await {
                    if outcome.is_terminal() {
                        tally.terminal_outcomes += 1;
                    }
                    let _ = sink.send(RunnerEvent::Outcome(outcome));
                }
            };

            let stream = async {
                let (end, exit) = {
                    let ingest_fut = ingest.accept_and_ingest(listener, &outcome_tx);
                    tokio::pin!(ingest_fut);
                    tokio::select! {
                        end = &mut ingest_fut => (Some(end), None),
                        exit = child.wait() => {
                            match tokio::time::timeout(connect_grace, &mut ingest_fut).await {
                                Ok(end) => (Some(end), Some(exit)),
                                Err(_) => (None, Some(exit)),
                            }
                        }
                    }
                };
                let end = end.unwrap_or_else(|| ingest.end());
                let parse_errors = ingest.parse_errors();
                drop(outcome_tx);
                let exit = match exit {
                    Some(exit) => exit,
                    None => child.wait().await,
                };
                (end, parse_errors, exit)
            };

            let ((end, parse_errors, exit), ()) = tokio::join!(stream, forward);
            tally.stream_end = Some(end);
            tally.parse_errors += parse_errors;
            exit
        }
    }
}
