// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testmux: discovering, running and tracking the status of Python tests
//! written against pytest or unittest, behind one framework-agnostic test tree.
//!
//! The basic flow of operations is:
//!
//! 1. A [`WorkspaceTestManagerService`](service::WorkspaceTestManagerService) hands out one
//!    [`TestManagerService`](service::TestManagerService) per workspace root.
//! 2. That service lazily creates a [`TestManager`](manager::TestManager) per
//!    [`TestProvider`](provider::TestProvider).
//! 3. The manager discovers tests into a canonical [`TestTree`](tree::TestTree), runs subsets of
//!    it through a [`TestRunner`](runner::TestRunner), and folds parsed outcomes back into the
//!    tree.
//! 4. Tree mutations are published as [`ManagerEvent`](events::ManagerEvent)s, which the
//!    [`StatusUpdaterService`](status::StatusUpdaterService) coalesces for UI consumers.

pub mod args;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod helpers;
pub mod manager;
pub mod parser;
pub mod process;
pub mod provider;
pub mod runner;
pub mod service;
pub mod signal;
pub mod status;
mod stopwatch;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_helpers;
