// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test managers: one per workspace root and provider.
//!
//! A [`TestManager`] holds the current [`TestTree`] for its provider, and is the only thing that
//! mutates it. It serializes discovery and runs through a small phase machine:
//!
//! ```text
//! Uninitialized -> Discovering -> Ready <-> Running
//!                                 Ready  -> Discovering -> Ready
//! ```
//!
//! At most one discovery or run is active at a time. Outcomes from a run are applied in batches
//! on a single path, and each applied batch is published as a [`ManagerEvent::TreeMutated`].

use crate::{
    config::{ProviderSettings, SettingsSource},
    discovery::{DiscoveredTree, DiscoveryService},
    errors::{
        ConcurrentRunError, DiscoverTestsError, IncompleteReason, IncompleteRunError,
        RunTestsError,
    },
    events::{ManagerEvent, MutationCause, RunCompletion, RunStats, TreeMutation},
    helpers::plural,
    parser::{TestOutcome, socket::StreamEnd},
    process::{CommandDebugLauncher, DebugLauncher, ProcessSpawner},
    provider::{IngestionKind, TestProvider},
    runner::{
        ProcessError, RunId, RunInvocation, RunStopHandle, RunTarget, RunnerEvent, RunnerReport,
        RunnerState, TestRunnerBuilder,
    },
    service::ManagerContext,
    stopwatch::stopwatch,
    tree::{FlatIndex, LastRun, NodeIndex, ResultResetVisitor, StableId, TestStatus, TestTree},
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use indexmap::IndexSet;
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// The message given to tests that never reached a terminal status.
pub const DID_NOT_COMPLETE: &str = "did not complete";

/// The phase a [`TestManager`] is in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagerPhase {
    /// No discovery has completed yet.
    Uninitialized,

    /// Tests are being discovered.
    Discovering,

    /// Idle, with the last-known-good tree (if any).
    Ready,

    /// A run is active.
    Running,
}

impl ManagerPhase {
    /// Returns true if a new discovery or run can start in this phase.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Ready)
    }

    /// Returns the string form of this phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run tests. Immutable once built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    /// The provider to run.
    pub provider: TestProvider,

    /// The workspace root to run in.
    pub workspace_root: Utf8PathBuf,

    /// The stable ids to run, or `None` to run everything. Ids may name folders, files or
    /// suites, in which case every test under them is run.
    pub subset: Option<Vec<StableId>>,

    /// If true, the test process is launched under the configured debugger.
    pub debug: bool,

    /// If set, replaces the configured framework arguments for this run.
    pub args_override: Option<Vec<String>>,
}

impl RunRequest {
    /// Creates a request that runs every test.
    pub fn all(provider: TestProvider, workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            provider,
            workspace_root: workspace_root.into(),
            subset: None,
            debug: false,
            args_override: None,
        }
    }

    /// Restricts the request to `ids`.
    pub fn with_subset(mut self, ids: impl IntoIterator<Item = StableId>) -> Self {
        self.subset = Some(ids.into_iter().collect());
        self
    }

    /// Sets whether to run under the debugger.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Replaces the configured framework arguments for this run.
    pub fn with_args_override(mut self, args: Vec<String>) -> Self {
        self.args_override = Some(args);
        self
    }
}

/// The result of a run, returned by [`TestManager::run_tests`].
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// The run id.
    pub run_id: RunId,

    /// The terminal state of the run.
    pub state: RunnerState,

    /// True if the run was cancelled by the run timeout.
    pub timed_out: bool,

    /// Counts of results among the targeted tests.
    pub stats: RunStats,

    /// Set if the test process exited unclean.
    pub process_error: Option<ProcessError>,

    /// Set if some targeted tests never reached a terminal status and were marked as errored.
    pub incomplete: Option<IncompleteRunError>,

    /// When the run started.
    pub start_time: DateTime<FixedOffset>,

    /// How long the run took.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct TreeState {
    tree: TestTree,
    index: FlatIndex,
}

/// Owns the test tree for one provider in one workspace.
#[derive(Debug)]
pub struct TestManager {
    provider: TestProvider,
    workspace_root: Utf8PathBuf,
    settings: Arc<dyn SettingsSource>,
    spawner: Arc<dyn ProcessSpawner>,
    debug_launcher: Option<Arc<dyn DebugLauncher>>,
    events: Option<mpsc::UnboundedSender<ManagerEvent>>,
    connect_grace: Option<Duration>,
    phase: watch::Sender<ManagerPhase>,
    active_run: Mutex<Option<RunStopHandle>>,
    state: RwLock<Option<TreeState>>,
}

impl TestManager {
    pub(crate) fn new(
        provider: TestProvider,
        workspace_root: impl Into<Utf8PathBuf>,
        ctx: &ManagerContext,
    ) -> Self {
        Self {
            provider,
            workspace_root: workspace_root.into(),
            settings: ctx.settings.clone(),
            spawner: ctx.spawner.clone(),
            debug_launcher: ctx.debug_launcher.clone(),
            events: ctx.events.clone(),
            connect_grace: ctx.connect_grace,
            phase: watch::Sender::new(ManagerPhase::Uninitialized),
            active_run: Mutex::new(None),
            state: RwLock::new(None),
        }
    }

    /// Returns the provider this manager runs.
    pub fn provider(&self) -> TestProvider {
        self.provider
    }

    /// Returns the workspace root this manager belongs to.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the current phase.
    pub fn phase(&self) -> ManagerPhase {
        *self.phase.borrow()
    }

    /// Returns a receiver that observes phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<ManagerPhase> {
        self.phase.subscribe()
    }

    /// Calls `f` with the current tree and its index, or returns `None` if nothing has been
    /// discovered yet.
    ///
    /// The tree seen by `f` is always complete: either before or after any given discovery or
    /// batch of results, never partway through.
    pub fn with_tree<R>(&self, f: impl FnOnce(&TestTree, &FlatIndex) -> R) -> Option<R> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.as_ref().map(|state| f(&state.tree, &state.index))
    }

    /// Returns a copy of the current tree, if one has been discovered.
    pub fn tree_snapshot(&self) -> Option<TestTree> {
        self.with_tree(|tree, _| tree.clone())
    }

    /// Returns the status of the node with the given id.
    pub fn status_of(&self, id: &StableId) -> Option<TestStatus> {
        self.with_tree(|tree, index| index.get(id).map(|node| tree.node(node).status()))
            .flatten()
    }

    /// Discovers tests and replaces the tree.
    ///
    /// If a run is active, it's stopped first. If discovery fails, the previous tree is kept
    /// and the error is returned.
    pub async fn discover_tests(&self) -> Result<(), DiscoverTestsError> {
        let guard = loop {
            match self.claim(ManagerPhase::Discovering, None) {
                Ok(guard) => break guard,
                Err(busy) => {
                    if busy == ManagerPhase::Running {
                        debug!("{}: stopping active run before discovery", self.provider);
                        self.stop_tests().await;
                    }
                    let mut rx = self.phase.subscribe();
                    let _ = rx.wait_for(|phase| phase.is_idle()).await;
                }
            }
        };
        let settings = self.settings.get_settings(&self.workspace_root, self.provider)?;
        let result = self.discover_claimed(&settings).await;
        drop(guard);
        result
    }

    /// Runs tests.
    ///
    /// Returns [`RunTestsError::Concurrent`] if a discovery or run is already active; the
    /// active operation is unaffected. If no tests have been discovered yet, discovery runs
    /// first.
    pub async fn run_tests(&self, request: RunRequest) -> Result<RunSummary, RunTestsError> {
        if request.provider != self.provider || request.workspace_root != self.workspace_root {
            return Err(RunTestsError::RequestMismatch {
                provider: self.provider,
                workspace_root: self.workspace_root.clone(),
                request_provider: request.provider,
                request_root: request.workspace_root,
            });
        }

        let mut settings = self.settings.get_settings(&self.workspace_root, self.provider)?;
        if let Some(args) = &request.args_override {
            settings.args.clone_from(args);
        }
        let debug_launcher = if request.debug {
            Some(self.resolve_debug_launcher(&settings)?)
        } else {
            None
        };

        let stop_handle = RunStopHandle::new();
        let needs_discovery = self.with_tree(|_, _| ()).is_none();
        let initial = if needs_discovery {
            ManagerPhase::Discovering
        } else {
            ManagerPhase::Running
        };
        let guard = self
            .claim(initial, Some(stop_handle.clone()))
            .map_err(|phase| ConcurrentRunError::new(&self.workspace_root, self.provider, phase))?;
        if needs_discovery {
            self.discover_claimed(&settings)
                .await
                .map_err(RunTestsError::Discovery)?;
            guard.transition(ManagerPhase::Running);
        }

        let run_id = RunId::new();
        let stopwatch = stopwatch();
        let (targets, targeted) = self.prepare_run(run_id, request.subset.as_deref());
        let mut run = RunProgress::new(targeted, self.provider.ingestion());

        if targets.is_empty() {
            info!(%run_id, "{}: no tests selected, nothing to run", self.provider);
            let snapshot = stopwatch.snapshot();
            let summary = self.finish_run(
                &mut run,
                RunFinish {
                    run_id,
                    state: RunnerState::Completed,
                    timed_out: false,
                    process_error: None,
                    settle: None,
                    start_time: snapshot.start_time.fixed_offset(),
                    elapsed: snapshot.duration,
                },
            );
            drop(guard);
            return Ok(summary);
        }

        info!(
            %run_id,
            "{}: running {} {} in {}",
            self.provider,
            targets.len(),
            plural::tests_str(targets.len()),
            settings.root_directory,
        );
        let mut builder = TestRunnerBuilder::new();
        builder.set_stop_handle(stop_handle);
        if let Some(connect_grace) = self.connect_grace {
            builder.set_connect_grace(connect_grace);
        }
        let runner = builder.build(self.spawner.clone());
        let invocation = RunInvocation {
            run_id,
            settings,
            targets,
            run_all: request.subset.is_none(),
            debug_launcher,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (report, ()) = tokio::join!(
            runner.execute(invocation, tx),
            self.apply_events(run_id, rx, &mut run),
        );

        let finish = match report {
            Ok(report) => RunFinish::from_report(&report, self.provider.ingestion()),
            Err(err) => {
                warn!(%run_id, "{}: failed to start run: {err}", self.provider);
                let snapshot = stopwatch.snapshot();
                let finish = RunFinish {
                    run_id,
                    state: RunnerState::Failed,
                    timed_out: false,
                    process_error: None,
                    settle: None,
                    start_time: snapshot.start_time.fixed_offset(),
                    elapsed: snapshot.duration,
                };
                self.finish_run(&mut run, finish);
                drop(guard);
                return Err(RunTestsError::Setup(err));
            }
        };

        // Settle before releasing the claim: once the phase is idle, stop_tests returns and
        // another run or discovery may start.
        let summary = self.finish_run(&mut run, finish);
        drop(guard);
        Ok(summary)
    }

    /// Stops the active run, if any, and waits for it to wind down.
    ///
    /// Tests that hadn't reported a result revert to [`TestStatus::NotRun`].
    pub async fn stop_tests(&self) {
        let handle = self
            .active_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handle {
            Some(handle) => {
                info!("{}: stopping tests in {}", self.provider, self.workspace_root);
                handle.stop();
                handle.finished().await;
            }
            None => debug!("{}: no active run to stop", self.provider),
        }
    }

    // ---
    // Helper methods
    // ---

    /// Moves from an idle phase to `to`. Returns the busy phase on failure.
    fn claim(
        &self,
        to: ManagerPhase,
        stop_handle: Option<RunStopHandle>,
    ) -> Result<PhaseGuard<'_>, ManagerPhase> {
        let mut busy = None;
        self.phase.send_if_modified(|phase| {
            if phase.is_idle() {
                *self
                    .active_run
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = stop_handle.clone();
                debug!("{}: {phase} -> {to}", self.provider);
                *phase = to;
                true
            } else {
                busy = Some(*phase);
                false
            }
        });
        match busy {
            Some(phase) => Err(phase),
            None => Ok(PhaseGuard {
                manager: self,
                stop_handle,
            }),
        }
    }

    /// Discovers and swaps in the new tree. The caller must hold a phase claim.
    async fn discover_claimed(
        &self,
        settings: &ProviderSettings,
    ) -> Result<(), DiscoverTestsError> {
        let discovery = DiscoveryService::new(self.provider, self.spawner.clone());
        let DiscoveredTree { mut tree, index } = match discovery.discover(settings).await {
            Ok(discovered) => discovered,
            Err(err) => {
                warn!(
                    "{}: discovery failed, keeping the previous tree: {err}",
                    self.provider
                );
                return Err(err);
            }
        };

        let mut affected: IndexSet<StableId> = tree
            .preorder(NodeIndex::ROOT)
            .map(|node| tree.node(node).id().clone())
            .collect();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = state.as_ref() {
                tree.carry_forward(&previous.tree, &previous.index);
                // Nodes that disappeared.
                affected.extend(
                    previous
                        .tree
                        .preorder(NodeIndex::ROOT)
                        .map(|node| previous.tree.node(node).id())
                        .filter(|id| index.get(id).is_none())
                        .cloned(),
                );
            }
            let root_status = tree.root().status();
            *state = Some(TreeState { tree, index });
            self.emit_mutation(None, MutationCause::Discovery, affected, root_status);
        }
        Ok(())
    }

    /// Resolves the run's targets and resets their results.
    fn prepare_run(
        &self,
        run_id: RunId,
        subset: Option<&[StableId]>,
    ) -> (Vec<RunTarget>, IndexSet<NodeIndex>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(TreeState { tree, index }) = state.as_mut() else {
            return (Vec::new(), IndexSet::new());
        };

        let targeted: IndexSet<NodeIndex> = match subset {
            None => index.leaves().iter().copied().collect(),
            Some(ids) => {
                let mut targeted = IndexSet::new();
                for id in ids {
                    match index.get(id) {
                        Some(node) => targeted.extend(tree.leaves_under(node)),
                        None => debug!(%run_id, "ignoring unknown test id `{id}`"),
                    }
                }
                targeted
            }
        };
        let targets = targeted
            .iter()
            .map(|&leaf| {
                let node = tree.node(leaf);
                RunTarget {
                    id: node.id().clone(),
                    native_id: node.native_id().to_owned(),
                }
            })
            .collect();

        let affected = ResultResetVisitor::reset(tree, index, subset);
        let root_status = tree.root().status();
        self.emit_mutation(
            Some(run_id),
            MutationCause::Reset,
            affected.into_iter().collect(),
            root_status,
        );
        (targets, targeted)
    }

    /// Applies runner events to the tree until the runner is done.
    async fn apply_events(
        &self,
        run_id: RunId,
        mut rx: mpsc::UnboundedReceiver<RunnerEvent>,
        run: &mut RunProgress,
    ) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(event) = rx.try_recv() {
                batch.push(event);
            }

            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(TreeState { tree, index }) = state.as_mut() else {
                continue;
            };
            let mut affected = IndexSet::new();
            for event in batch {
                match event {
                    RunnerEvent::Spawned { pid } => {
                        debug!(%run_id, "test process spawned (pid {pid:?})");
                        if run.ingestion == IngestionKind::Batch {
                            for &leaf in &run.targeted {
                                affected.extend(tree.set_leaf_status(
                                    leaf,
                                    TestStatus::Running,
                                    LastRun::default(),
                                ));
                            }
                        }
                    }
                    RunnerEvent::Outcome(outcome) => {
                        affected.extend(run.apply(run_id, tree, index, outcome));
                    }
                }
            }
            if !affected.is_empty() {
                let root_status = tree.root().status();
                self.emit_mutation(Some(run_id), MutationCause::Results, affected, root_status);
            }
        }
    }

    /// Settles tests that never reported, and publishes the run's completion.
    fn finish_run(&self, run: &mut RunProgress, finish: RunFinish) -> RunSummary {
        let RunFinish {
            run_id,
            state,
            timed_out,
            process_error,
            settle,
            start_time,
            elapsed,
        } = finish;

        let mut stats = RunStats::default();
        let mut incomplete_ids = Vec::new();
        let root_status = {
            let mut tree_state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match tree_state.as_mut() {
                Some(TreeState { tree, .. }) => {
                    let mut affected = IndexSet::new();
                    for &leaf in &run.targeted {
                        if !run.reported.contains(&leaf) {
                            let (status, last_run) = match settle {
                                Some(reason) => {
                                    incomplete_ids.push(tree.node(leaf).id().clone());
                                    (
                                        TestStatus::Error,
                                        LastRun {
                                            duration: None,
                                            message: Some(format!("{DID_NOT_COMPLETE}: {reason}")),
                                            traceback: None,
                                        },
                                    )
                                }
                                None => (TestStatus::NotRun, LastRun::default()),
                            };
                            affected.extend(tree.set_leaf_status(leaf, status, last_run));
                        }
                        stats.record(tree.node(leaf).status());
                    }
                    let root_status = tree.root().status();
                    if !affected.is_empty() {
                        self.emit_mutation(
                            Some(run_id),
                            MutationCause::Settled,
                            affected,
                            root_status,
                        );
                    }
                    root_status
                }
                None => TestStatus::Idle,
            }
        };

        let incomplete = settle
            .filter(|_| !incomplete_ids.is_empty())
            .map(|reason| IncompleteRunError::new(reason, incomplete_ids));
        if let Some(incomplete) = &incomplete {
            warn!(%run_id, "{}: {incomplete}", self.provider);
        }
        info!(
            %run_id,
            "{}: run {state} in {:.2}s: {} passed, {} failed, {} skipped, {} errored, {} not run",
            self.provider,
            elapsed.as_secs_f64(),
            stats.passed,
            stats.failed,
            stats.skipped,
            stats.errored,
            stats.not_run,
        );

        self.emit(ManagerEvent::RunCompleted(RunCompletion {
            workspace_root: self.workspace_root.clone(),
            provider: self.provider,
            run_id,
            state,
            timed_out,
            stats,
            incomplete: incomplete.as_ref().map_or(0, |err| err.ids().len()),
            process_error: process_error.clone(),
            root_status,
            start_time,
            elapsed,
        }));

        RunSummary {
            run_id,
            state,
            timed_out,
            stats,
            process_error,
            incomplete,
            start_time,
            elapsed,
        }
    }

    fn resolve_debug_launcher(
        &self,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn DebugLauncher>, RunTestsError> {
        if let Some(launcher) = &self.debug_launcher {
            return Ok(launcher.clone());
        }
        settings
            .debugger
            .clone()
            .and_then(CommandDebugLauncher::new)
            .map(|launcher| Arc::new(launcher) as Arc<dyn DebugLauncher>)
            .ok_or(RunTestsError::NoDebugger {
                provider: self.provider,
            })
    }

    fn emit_mutation(
        &self,
        run_id: Option<RunId>,
        cause: MutationCause,
        affected: IndexSet<StableId>,
        root_status: TestStatus,
    ) {
        self.emit(ManagerEvent::TreeMutated(TreeMutation {
            workspace_root: self.workspace_root.clone(),
            provider: self.provider,
            run_id,
            cause,
            affected: affected.into_iter().collect(),
            root_status,
        }));
    }

    fn emit(&self, event: ManagerEvent) {
        if let Some(events) = &self.events {
            // Listeners going away doesn't affect the manager.
            let _ = events.send(event);
        }
    }
}

/// Releases a phase claim on drop, returning the manager to `Ready`.
#[derive(Debug)]
struct PhaseGuard<'a> {
    manager: &'a TestManager,
    stop_handle: Option<RunStopHandle>,
}

impl PhaseGuard<'_> {
    fn transition(&self, to: ManagerPhase) {
        let from = self.manager.phase.send_replace(to);
        debug!("{}: {from} -> {to}", self.manager.provider);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .active_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.transition(ManagerPhase::Ready);
        if let Some(stop_handle) = &self.stop_handle {
            stop_handle.mark_finished();
        }
    }
}

/// Which leaves a run targets, and which of them have reported.
#[derive(Debug)]
struct RunProgress {
    targeted: IndexSet<NodeIndex>,
    reported: HashSet<NodeIndex>,
    ingestion: IngestionKind,
}

impl RunProgress {
    fn new(targeted: IndexSet<NodeIndex>, ingestion: IngestionKind) -> Self {
        Self {
            targeted,
            reported: HashSet::new(),
            ingestion,
        }
    }

    /// Applies one outcome. Outcomes for tests outside the run are ignored.
    fn apply(
        &mut self,
        run_id: RunId,
        tree: &mut TestTree,
        index: &FlatIndex,
        outcome: TestOutcome,
    ) -> Vec<StableId> {
        let Some(leaf) = index
            .get(&outcome.id)
            .filter(|leaf| self.targeted.contains(leaf))
        else {
            debug!(%run_id, "ignoring outcome for `{}`, which isn't part of this run", outcome.id);
            return Vec::new();
        };

        if outcome.is_terminal() {
            self.reported.insert(leaf);
        } else if self.reported.contains(&leaf) {
            // A late start notification never overrides a result.
            return Vec::new();
        }
        if let Some(line) = outcome.line {
            tree.set_line(leaf, line);
        }
        tree.set_leaf_status(
            leaf,
            outcome.status,
            LastRun {
                duration: outcome.duration,
                message: outcome.message,
                traceback: outcome.traceback,
            },
        )
    }
}

/// How a run ended, and how to settle tests that never reported.
#[derive(Debug)]
struct RunFinish {
    run_id: RunId,
    state: RunnerState,
    timed_out: bool,
    process_error: Option<ProcessError>,
    // None: unreported tests revert to NotRun. Some: they're marked as errored.
    settle: Option<IncompleteReason>,
    start_time: DateTime<FixedOffset>,
    elapsed: Duration,
}

impl RunFinish {
    fn from_report(report: &RunnerReport, ingestion: IngestionKind) -> Self {
        let settle = if report.timed_out {
            Some(IncompleteReason::TimedOut)
        } else if report.state == RunnerState::Cancelled {
            None
        } else {
            match ingestion {
                IngestionKind::Batch => None,
                IngestionKind::Streaming => Some(match report.stream_end {
                    Some(StreamEnd::Ended) => IncompleteReason::MissingOutcomes,
                    Some(StreamEnd::Disconnected) => IncompleteReason::StreamDisconnected,
                    Some(StreamEnd::NeverConnected) | None => {
                        IncompleteReason::StreamNeverConnected
                    }
                }),
            }
        };
        Self {
            run_id: report.run_id,
            state: report.state,
            timed_out: report.timed_out,
            process_error: report.process_error.clone(),
            settle,
            start_time: report.start_time,
            elapsed: report.elapsed,
        }
    }
}
