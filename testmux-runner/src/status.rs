// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Coalescing tree mutations into status updates for UI consumers.
//!
//! Runs can produce many mutations in quick succession. The [`StatusUpdaterService`] merges
//! mutations per `(workspace root, provider)` and flushes them once per debounce window, so a
//! UI redraws at most once per window per tree. Run completions are never delayed: pending
//! mutations for the same tree are flushed first, then the completion is delivered.

use crate::{
    events::{ManagerEvent, RunCompletion, TreeMutation},
    provider::TestProvider,
    runner::RunId,
    tree::{StableId, TestStatus},
};
use camino::Utf8PathBuf;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::debug;

/// A coalesced update delivered to listeners.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatusUpdate {
    /// Statuses in a tree changed.
    Changed(StatusChange),

    /// A run reached a terminal state.
    RunCompleted(RunCompletion),
}

/// One or more tree mutations, merged.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StatusChange {
    /// The workspace root.
    pub workspace_root: Utf8PathBuf,

    /// The provider whose tree changed.
    pub provider: TestProvider,

    /// The most recent run among the merged mutations, if any.
    pub run_id: Option<RunId>,

    /// The union of affected ids, in first-seen order.
    pub affected: Vec<StableId>,

    /// The root status as of the latest merged mutation.
    pub root_status: TestStatus,

    /// The number of mutations merged into this update.
    pub coalesced: usize,
}

type Key = (Utf8PathBuf, TestProvider);

#[derive(Debug)]
struct Pending {
    run_id: Option<RunId>,
    affected: IndexSet<StableId>,
    root_status: TestStatus,
    coalesced: usize,
    deadline: Instant,
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<StatusUpdate>>>>;

/// Debounces manager events and fans them out to listeners.
#[derive(Debug)]
pub struct StatusUpdaterService {
    listeners: Listeners,
    task: JoinHandle<()>,
}

impl StatusUpdaterService {
    /// Spawns the service on the current tokio runtime, reading events from `events`.
    ///
    /// The service shuts down, after a final flush, once every sender for `events` has been
    /// dropped.
    pub fn spawn(debounce: Duration, events: mpsc::UnboundedReceiver<ManagerEvent>) -> Self {
        let listeners = Listeners::default();
        let task = tokio::spawn(run_loop(debounce, events, listeners.clone()));
        Self { listeners, task }
    }

    /// Returns a receiver for every update delivered from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Waits for the service to shut down.
    pub async fn join(self) {
        // The loop doesn't panic; a cancelled task has nothing left to deliver.
        let _ = self.task.await;
    }
}

async fn run_loop(
    debounce: Duration,
    mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    listeners: Listeners,
) {
    let mut pending: IndexMap<Key, Pending> = IndexMap::new();
    loop {
        let next_deadline = pending.values().map(|pending| pending.deadline).min();
        tokio::select! {
            event = events.recv() => match event {
                Some(ManagerEvent::TreeMutated(mutation)) => {
                    merge(&mut pending, mutation, debounce);
                }
                Some(ManagerEvent::RunCompleted(completion)) => {
                    let key = (completion.workspace_root.clone(), completion.provider);
                    if let Some(entry) = pending.shift_remove(&key) {
                        deliver(&listeners, StatusUpdate::Changed(into_change(key, entry)));
                    }
                    deliver(&listeners, StatusUpdate::RunCompleted(completion));
                }
                None => {
                    for (key, entry) in pending.drain(..) {
                        deliver(&listeners, StatusUpdate::Changed(into_change(key, entry)));
                    }
                    debug!("status updater: all event senders dropped, shutting down");
                    break;
                }
            },
            () = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<Key> = pending
                    .iter()
                    .filter(|(_, entry)| entry.deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    if let Some(entry) = pending.shift_remove(&key) {
                        deliver(&listeners, StatusUpdate::Changed(into_change(key, entry)));
                    }
                }
            }
        }
    }
}

fn merge(pending: &mut IndexMap<Key, Pending>, mutation: TreeMutation, debounce: Duration) {
    let TreeMutation {
        workspace_root,
        provider,
        run_id,
        affected,
        root_status,
        ..
    } = mutation;
    let entry = pending
        .entry((workspace_root, provider))
        .or_insert_with(|| Pending {
            run_id: None,
            affected: IndexSet::new(),
            root_status,
            coalesced: 0,
            deadline: Instant::now() + debounce,
        });
    if run_id.is_some() {
        entry.run_id = run_id;
    }
    entry.affected.extend(affected);
    entry.root_status = root_status;
    entry.coalesced += 1;
}

fn into_change((workspace_root, provider): Key, entry: Pending) -> StatusChange {
    StatusChange {
        workspace_root,
        provider,
        run_id: entry.run_id,
        affected: entry.affected.into_iter().collect(),
        root_status: entry.root_status,
        coalesced: entry.coalesced,
    }
}

fn deliver(listeners: &Listeners, update: StatusUpdate) {
    let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
    listeners.retain(|listener| listener.send(update.clone()).is_ok());
}
