// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testmux-runner.

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        tests_plural_if(count != 1)
    }

    /// Returns "tests" if `plural` is true, otherwise "test".
    pub fn tests_plural_if(plural: bool) -> &'static str {
        if plural { "tests" } else { "test" }
    }

    /// Returns "node" if `count` is 1, otherwise "nodes".
    pub fn nodes_str(count: usize) -> &'static str {
        if count == 1 { "node" } else { "nodes" }
    }
}
