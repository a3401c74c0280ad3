// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A fake process model for driving managers without Python.
//!
//! [`FakeSpawner`] answers discovery commands with canned output, and hands run commands to a
//! closure that plays the part of the test process: writing an XUnit report, or connecting to the
//! result socket and streaming messages.

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt};
use std::{
    fmt, io,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};
use testmux_runner::{
    config::{ProviderSettings, SettingsSource},
    errors::{ConfigParseError, ProcessLaunchError},
    events::ManagerEvent,
    manager::TestManager,
    process::{ChildHandle, ProcessOutput, ProcessSpawner, ProcessSpec},
    provider::TestProvider,
    runner::RESULT_PORT_ENV,
    service::{ManagerContext, create_test_manager},
    tree::{StableId, TestStatus},
};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc, task::JoinHandle};

pub(crate) const WORKSPACE_ROOT: &str = "/workspace";

pub(crate) const PYTEST_COLLECTION: &str = "\
tests/test_math.py::test_add
tests/test_math.py::TestDivide::test_by_one
tests/test_math.py::TestDivide::test_by_zero
tests/test_strings.py::test_upper[a-A]
tests/test_strings.py::test_upper[b-B]

5 tests collected in 0.02s
";

pub(crate) const UNITTEST_COLLECTION: &str = "\
start
test_m.T.test_a\ttest_m.py\t4
test_m.T.test_b\ttest_m.py\t7
test_m.T.test_c\ttest_m.py\t10
";

pub(crate) type RunBehavior =
    Arc<dyn Fn(FakeRun) -> BoxFuture<'static, ProcessOutput> + Send + Sync>;

/// A spawner that never launches real processes.
#[derive(Clone)]
pub(crate) struct FakeSpawner {
    collection: Arc<Mutex<ProcessOutput>>,
    run: Arc<Mutex<RunBehavior>>,
    launched: Arc<Mutex<Vec<ProcessSpec>>>,
}

impl fmt::Debug for FakeSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSpawner")
            .field("launched", &self.launched)
            .finish_non_exhaustive()
    }
}

impl FakeSpawner {
    pub(crate) fn new(collection: &str) -> Self {
        let run: RunBehavior = Arc::new(|_| async { exited(0) }.boxed());
        Self {
            collection: Arc::new(Mutex::new(collected(collection, 0))),
            run: Arc::new(Mutex::new(run)),
            launched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replaces the output of subsequent discovery commands.
    pub(crate) fn set_collection(&self, stdout: &str, exit_code: i32) {
        *self.collection.lock().unwrap() = collected(stdout, exit_code);
    }

    /// Replaces the behavior of subsequent run commands.
    pub(crate) fn on_run<F, Fut>(&self, f: F)
    where
        F: Fn(FakeRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessOutput> + Send + 'static,
    {
        *self.run.lock().unwrap() = Arc::new(move |run| f(run).boxed());
    }

    /// Returns every spec launched so far.
    pub(crate) fn launched(&self) -> Vec<ProcessSpec> {
        self.launched.lock().unwrap().clone()
    }

    /// Returns the specs of run commands launched so far.
    pub(crate) fn runs(&self) -> Vec<ProcessSpec> {
        self.launched()
            .into_iter()
            .filter(is_run)
            .collect()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, ProcessLaunchError> {
        self.launched.lock().unwrap().push(spec.clone());
        let fut = if is_run(spec) {
            let behavior = self.run.lock().unwrap().clone();
            behavior(FakeRun { spec: spec.clone() })
        } else {
            let output = self.collection.lock().unwrap().clone();
            async move { output }.boxed()
        };
        Ok(Box::new(FakeChild {
            task: tokio::spawn(fut),
            output: None,
        }))
    }
}

fn is_run(spec: &ProcessSpec) -> bool {
    spec.args
        .iter()
        .any(|arg| arg.starts_with("--junit-xml=") || arg == "--port")
}

/// A fake child backed by a tokio task. Killing it aborts the task.
struct FakeChild {
    task: JoinHandle<ProcessOutput>,
    output: Option<ProcessOutput>,
}

impl ChildHandle for FakeChild {
    fn id(&self) -> Option<u32> {
        None
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ProcessOutput>> {
        async move {
            if let Some(output) = &self.output {
                return Ok(output.clone());
            }
            let output = (&mut self.task).await.unwrap_or(ProcessOutput {
                exit_code: None,
                ..ProcessOutput::default()
            });
            self.output = Some(output.clone());
            Ok(output)
        }
        .boxed()
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        self.task.abort();
        async {}.boxed()
    }
}

/// The view a fake test process has of its invocation.
#[derive(Clone, Debug)]
pub(crate) struct FakeRun {
    pub(crate) spec: ProcessSpec,
}

impl FakeRun {
    /// The path pytest was asked to write its XUnit report to.
    pub(crate) fn junit_path(&self) -> Utf8PathBuf {
        self.spec
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("--junit-xml="))
            .map(Utf8PathBuf::from)
            .expect("batch run has a --junit-xml argument")
    }

    /// Writes an XUnit report.
    pub(crate) async fn write_report(&self, xml: &str) {
        tokio::fs::write(self.junit_path(), xml)
            .await
            .expect("report written");
    }

    /// Connects to the result socket.
    pub(crate) async fn connect(&self) -> TcpStream {
        let port: u16 = self
            .spec
            .env_var(RESULT_PORT_ENV)
            .expect("streaming run has a result port")
            .parse()
            .expect("port is a number");
        TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("connected to result socket")
    }
}

/// Writes newline-terminated messages to a result stream.
pub(crate) async fn send_lines(stream: &mut TcpStream, lines: &[&str]) {
    for line in lines {
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("message written");
    }
    stream.flush().await.expect("stream flushed");
}

pub(crate) fn exited(exit_code: i32) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(exit_code),
        ..ProcessOutput::default()
    }
}

fn collected(stdout: &str, exit_code: i32) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_owned().into(),
        stderr: if exit_code == 0 {
            Default::default()
        } else {
            "ERROR: collection failed".into()
        },
    }
}

/// Settings built in memory rather than read from a config file.
#[derive(Clone, Debug)]
pub(crate) struct StaticSettings {
    pub(crate) run_timeout: Duration,
    pub(crate) debugger: Option<Vec<String>>,
    pub(crate) unittest_enabled: bool,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(30),
            debugger: None,
            unittest_enabled: true,
        }
    }
}

impl SettingsSource for StaticSettings {
    fn get_settings(
        &self,
        workspace_root: &Utf8Path,
        provider: TestProvider,
    ) -> Result<ProviderSettings, ConfigParseError> {
        Ok(ProviderSettings {
            provider,
            enabled: match provider {
                TestProvider::Pytest => true,
                TestProvider::Unittest => self.unittest_enabled,
            },
            args: Vec::new(),
            root_directory: workspace_root.to_owned(),
            python: "python3".to_owned(),
            debugger: self.debugger.clone(),
            run_timeout: self.run_timeout,
        })
    }
}

/// A manager wired to a fake spawner, plus the receiving end of its events.
pub(crate) struct Harness {
    pub(crate) manager: Arc<TestManager>,
    pub(crate) spawner: FakeSpawner,
    pub(crate) events: mpsc::UnboundedReceiver<ManagerEvent>,
}

impl Harness {
    pub(crate) fn new(provider: TestProvider, settings: StaticSettings) -> Self {
        let collection = match provider {
            TestProvider::Pytest => PYTEST_COLLECTION,
            TestProvider::Unittest => UNITTEST_COLLECTION,
        };
        let spawner = FakeSpawner::new(collection);
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = ManagerContext::new(Arc::new(spawner.clone()), Arc::new(settings))
            .with_events(tx)
            .with_connect_grace(Duration::from_millis(200));
        let manager = Arc::new(create_test_manager(provider, WORKSPACE_ROOT, &ctx));
        Self {
            manager,
            spawner,
            events,
        }
    }

    pub(crate) fn status(&self, id: &str) -> TestStatus {
        self.manager
            .status_of(&StableId::new(id))
            .unwrap_or_else(|| panic!("`{id}` is in the tree"))
    }

    pub(crate) fn message(&self, id: &str) -> Option<String> {
        self.manager
            .with_tree(|tree, index| {
                let node = index.get(&StableId::new(id))?;
                tree.node(node).last_run().message.clone()
            })
            .flatten()
    }

    /// Waits until a results mutation reports `id` with `status`.
    pub(crate) async fn wait_for_status(&mut self, id: &str, status: TestStatus) {
        let wait = async {
            loop {
                if self.manager.status_of(&StableId::new(id)) == Some(status) {
                    return;
                }
                self.events.recv().await.expect("manager is alive");
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .unwrap_or_else(|_| panic!("`{id}` never reached {status}"));
    }
}
