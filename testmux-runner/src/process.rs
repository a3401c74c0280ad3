// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Launching discovery and test processes.
//!
//! The manager and runner only talk to processes through the [`ProcessSpawner`] and
//! [`ChildHandle`] traits, so that tests (and embedders) can substitute their own process model.
//! [`TokioSpawner`] is the standard implementation.

#[cfg(unix)]
#[path = "process/unix.rs"]
mod os;

#[cfg(windows)]
#[path = "process/windows.rs"]
mod os;

use crate::errors::ProcessLaunchError;
use bytes::Bytes;
use camino::Utf8PathBuf;
use futures::future::{BoxFuture, FutureExt};
use std::{fmt, io, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::debug;

/// How long a process gets to exit after being asked to terminate, before it's killed.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A description of a process to launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpec {
    /// The program to run.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// The working directory.
    pub cwd: Utf8PathBuf,

    /// Environment variables set in addition to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Creates a new spec for `program` running in `cwd`.
    pub fn new(program: impl Into<String>, cwd: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the value of an environment variable set on this spec, if any.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the command line, quoted for display.
    pub fn display_command(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }
}

/// The output of a process that has exited.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessOutput {
    /// The exit code, or `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,

    /// Captured standard output.
    pub stdout: Bytes,

    /// Captured standard error.
    pub stderr: Bytes,
}

impl ProcessOutput {
    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns standard error, lossily decoded.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Launches processes.
pub trait ProcessSpawner: fmt::Debug + Send + Sync {
    /// Launches the process described by `spec`.
    ///
    /// Standard input is closed; standard output and standard error are captured.
    fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, ProcessLaunchError>;
}

/// A handle to a launched process.
pub trait ChildHandle: Send {
    /// Returns the OS process id, if the process is still running.
    fn id(&self) -> Option<u32>;

    /// Waits for the process to exit and returns its output.
    ///
    /// This is cancel-safe: if the future is dropped before completion, calling `wait` again
    /// resumes waiting without losing output.
    fn wait(&mut self) -> BoxFuture<'_, io::Result<ProcessOutput>>;

    /// Terminates the process (and on Unix, its process group).
    ///
    /// The process is first asked to exit, then forcibly killed if it hasn't exited after a grace
    /// period. Output is still available through [`wait`](Self::wait) afterwards.
    fn kill(&mut self) -> BoxFuture<'_, ()>;
}

/// Launches a process under a debugger.
///
/// Used instead of plain spawning when a run request's debug flag is set. The returned handle has
/// the same shape as one from [`ProcessSpawner::spawn`].
pub trait DebugLauncher: fmt::Debug + Send + Sync {
    /// Launches `spec` under a debugger, using `spawner` to create the process.
    fn launch_under_debugger(
        &self,
        spawner: &dyn ProcessSpawner,
        spec: &ProcessSpec,
    ) -> Result<Box<dyn ChildHandle>, ProcessLaunchError>;
}

/// A [`DebugLauncher`] that prefixes the command line with a debugger command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandDebugLauncher {
    argv: Vec<String>,
}

impl CommandDebugLauncher {
    /// Creates a new launcher from the debugger's argv. Returns `None` if `argv` is empty.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        (!argv.is_empty()).then_some(Self { argv })
    }

    /// Returns the spec that's actually launched for `spec`.
    pub fn wrap(&self, spec: &ProcessSpec) -> ProcessSpec {
        let (program, prefix) = match self.argv.split_first() {
            Some((program, prefix)) => (program.clone(), prefix),
            None => (spec.program.clone(), &[][..]),
        };
        let mut wrapped = ProcessSpec::new(program, spec.cwd.clone());
        wrapped
            .args(prefix.iter().cloned())
            .arg(spec.program.clone())
            .args(spec.args.iter().cloned());
        wrapped.env = spec.env.clone();
        wrapped
    }
}

impl DebugLauncher for CommandDebugLauncher {
    fn launch_under_debugger(
        &self,
        spawner: &dyn ProcessSpawner,
        spec: &ProcessSpec,
    ) -> Result<Box<dyn ChildHandle>, ProcessLaunchError> {
        let wrapped = self.wrap(spec);
        debug!("launching under debugger: {}", wrapped.display_command());
        spawner.spawn(&wrapped)
    }
}

/// Spawns real processes with tokio.
#[derive(Clone, Debug)]
pub struct TokioSpawner {
    terminate_grace: Duration,
}

impl TokioSpawner {
    /// Creates a new spawner with the default termination grace period.
    pub fn new() -> Self {
        Self {
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    /// Sets the grace period between asking a process to exit and killing it.
    pub fn with_terminate_grace(mut self, terminate_grace: Duration) -> Self {
        self.terminate_grace = terminate_grace;
        self
    }
}

impl Default for TokioSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildHandle>, ProcessLaunchError> {
        let mut std_command = std::process::Command::new(&spec.program);
        std_command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        os::set_process_group(&mut std_command);

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        debug!("spawning `{}` in `{}`", spec.display_command(), spec.cwd);
        let mut child = command
            .spawn()
            .map_err(|err| ProcessLaunchError::new(&spec.program, &spec.cwd, err))?;

        // Drain both pipes from the start, so that a chatty process can't fill a pipe buffer and
        // block forever.
        let stdout = Captured::spawn(child.stdout.take());
        let stderr = Captured::spawn(child.stderr.take());
        let pid = child.id();

        Ok(Box::new(TokioChild {
            child,
            pid,
            stdout,
            stderr,
            terminate_grace: self.terminate_grace,
        }))
    }
}

#[derive(Debug)]
struct TokioChild {
    child: Child,
    // Cached so that the process group can still be signaled after the leader exits.
    pid: Option<u32>,
    stdout: Captured,
    stderr: Captured,
    terminate_grace: Duration,
}

impl ChildHandle for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ProcessOutput>> {
        async move {
            let status = self.child.wait().await?;
            let stdout = self.stdout.collect().await?;
            let stderr = self.stderr.collect().await?;
            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            })
        }
        .boxed()
    }

    fn kill(&mut self) -> BoxFuture<'_, ()> {
        async move {
            os::terminate_child(&mut self.child, self.pid, self.terminate_grace).await;
        }
        .boxed()
    }
}

#[derive(Debug)]
enum Captured {
    Pending(JoinHandle<io::Result<Vec<u8>>>),
    Done(Bytes),
}

impl Captured {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        match reader {
            Some(mut reader) => Self::Pending(tokio::spawn(async move {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(buf)
            })),
            None => Self::Done(Bytes::new()),
        }
    }

    async fn collect(&mut self) -> io::Result<Bytes> {
        let bytes: Bytes = match self {
            Self::Done(bytes) => return Ok(bytes.clone()),
            Self::Pending(handle) => handle.await.map_err(io::Error::other)??.into(),
        };
        *self = Self::Done(bytes.clone());
        Ok(bytes)
    }
}
