// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discover and run Python tests written against pytest or unittest, behind one test tree.
//!
//! The heavy lifting is done by [`testmux_runner`]; this crate is the command-line front end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;
mod reporter;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputContext;
