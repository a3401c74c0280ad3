// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for managers, driven by a fake process model.

mod batch;
mod fixtures;
mod lifecycle;
mod services;
mod streaming;
