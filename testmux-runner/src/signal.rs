// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for stopping runs on Ctrl-C and termination signals.

use crate::errors::SignalHandlerSetupError;
use std::fmt;

/// The kind of signal handling to set up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler. Capture interrupt and termination signals depending on the
    /// platform.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    /// Builds the signal handler.
    pub fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// Receives shutdown signals.
#[derive(Debug)]
pub struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    /// Creates a new `SignalHandler` that handles Ctrl-C and other termination signals.
    pub fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new()?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    /// Creates a new `SignalHandler` that never receives anything.
    pub fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next shutdown signal.
    ///
    /// Returns `None` once no more signals can be received. For a no-op handler, never
    /// returns.
    pub async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// Signals for SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                sigint: SignalWithDone::new(SignalKind::interrupt())?,
                sighup: SignalWithDone::new(SignalKind::hangup())?,
                sigterm: SignalWithDone::new(SignalKind::terminate())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Interrupt),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Hangup),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(ShutdownEvent::Term),
                            None => self.sigterm.done = true,
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            let signal = signal(kind)?;
            Ok(Self {
                signal,
                done: false,
            })
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let ctrl_c = ctrl_c()?;
            Ok(Self {
                ctrl_c,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(ShutdownEvent::Interrupt),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

/// A signal that should stop active runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    #[cfg(unix)]
    Hangup,

    /// SIGTERM.
    #[cfg(unix)]
    Term,

    /// SIGINT or Ctrl-C.
    Interrupt,
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Hangup => f.write_str("SIGHUP"),
            #[cfg(unix)]
            Self::Term => f.write_str("SIGTERM"),
            Self::Interrupt => f.write_str("interrupt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn noop_handler_never_fires() {
        let mut handler = SignalHandlerKind::Noop.build().expect("noop always builds");
        let recv = tokio::time::timeout(Duration::from_millis(20), handler.recv()).await;
        assert!(recv.is_err(), "no-op handler received {recv:?}");
    }
}
