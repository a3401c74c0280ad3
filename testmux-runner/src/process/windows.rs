// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

pub(super) fn set_process_group(_cmd: &mut std::process::Command) {
    // TODO: assign the child to a job object so that grandchildren are terminated too.
}

/// Kills the child. Windows has no graceful equivalent of SIGTERM for console processes.
pub(super) async fn terminate_child(child: &mut Child, _pid: Option<u32>, _grace_period: Duration) {
    if child.id().is_none() {
        return;
    }
    debug!("killing test process");
    if let Err(error) = child.start_kill() {
        debug!("failed to kill test process: {error}");
    }
}
