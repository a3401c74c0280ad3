// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use libc::{SIGKILL, SIGTERM};
use std::{os::unix::process::CommandExt, time::Duration};
use tokio::process::Child;
use tracing::debug;

/// Puts the child in its own process group, so that it and everything it spawns can be signaled
/// together.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

/// Sends SIGTERM to the child's process group, then SIGKILL if the leader hasn't exited after
/// `grace_period`.
pub(super) async fn terminate_child(child: &mut Child, pid: Option<u32>, grace_period: Duration) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    if child.id().is_none() {
        // The leader exited already, but stragglers in its group may hold the output pipes open.
        unsafe { libc::kill(-pid, SIGKILL) };
        return;
    }

    debug!("sending SIGTERM to process group {pid}");
    unsafe { libc::kill(-pid, SIGTERM) };

    tokio::select! {
        _ = child.wait() => {
            // Reap anything the leader left behind.
            unsafe { libc::kill(-pid, SIGKILL) };
        }
        () = tokio::time::sleep(grace_period) => {
            debug!("process group {pid} didn't exit within {grace_period:?}, sending SIGKILL");
            unsafe { libc::kill(-pid, SIGKILL) };
        }
    }
}
