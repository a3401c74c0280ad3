// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::{FakeSpawner, PYTEST_COLLECTION, StaticSettings, exited};
use camino::Utf8Path;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use testmux_runner::{
    errors::ManagerLookupError,
    manager::{ManagerPhase, RunRequest},
    provider::TestProvider,
    runner::RunnerState,
    service::{ManagerContext, WorkspaceTestManagerService, create_test_manager_service},
    status::{StatusUpdate, StatusUpdaterService},
};
use tokio::sync::mpsc;

fn context(spawner: &FakeSpawner, settings: StaticSettings) -> ManagerContext {
    ManagerContext::new(Arc::new(spawner.clone()), Arc::new(settings))
}

#[test]
fn managers_for_enabled_providers() -> Result<()> {
    let spawner = FakeSpawner::new(PYTEST_COLLECTION);
    let service = create_test_manager_service(
        "/workspace",
        context(
            &spawner,
            StaticSettings {
                unittest_enabled: false,
                ..StaticSettings::default()
            },
        ),
    );

    let managers = service.managers()?;
    assert_eq!(
        managers.keys().copied().collect::<Vec<_>>(),
        [TestProvider::Pytest]
    );
    assert!(matches!(
        service.manager(TestProvider::Unittest),
        Err(ManagerLookupError::ProviderDisabled {
            provider: TestProvider::Unittest,
            ..
        })
    ));

    // Managers are cached.
    let pytest = service.manager(TestProvider::Pytest)?;
    assert!(Arc::ptr_eq(&pytest, &managers[&TestProvider::Pytest]));
    assert_eq!(service.cached_managers().len(), 1);
    assert_eq!(
        service.preferred_manager()?.map(|manager| manager.provider()),
        Some(TestProvider::Pytest)
    );
    Ok(())
}

#[test]
fn one_service_per_workspace() -> Result<()> {
    let spawner = FakeSpawner::new(PYTEST_COLLECTION);
    let workspaces = WorkspaceTestManagerService::new(context(&spawner, StaticSettings::default()));

    let a = workspaces.get_manager(Utf8Path::new("/a"))?;
    let b = workspaces.get_manager(Utf8Path::new("/b"))?;
    assert_eq!(a.len(), 2);
    assert_eq!(a[&TestProvider::Pytest].workspace_root(), "/a");
    assert_eq!(b[&TestProvider::Unittest].workspace_root(), "/b");
    assert!(Arc::ptr_eq(
        &workspaces.service_for(Utf8Path::new("/a")),
        &workspaces.service_for(Utf8Path::new("/a")),
    ));
    assert_eq!(workspaces.workspace_roots(), ["/a", "/b"]);
    Ok(())
}

#[tokio::test]
async fn removing_a_workspace_stops_its_runs() -> Result<()> {
    let spawner = FakeSpawner::new(PYTEST_COLLECTION);
    spawner.on_run(|_| async {
        std::future::pending::<()>().await;
        exited(0)
    });
    let workspaces = WorkspaceTestManagerService::new(context(&spawner, StaticSettings::default()));
    let root = Utf8Path::new("/workspace");
    let manager = workspaces.service_for(root).manager(TestProvider::Pytest)?;

    let mut phase = manager.subscribe_phase();
    let run = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .run_tests(RunRequest::all(TestProvider::Pytest, "/workspace"))
                .await
        }
    });
    phase
        .wait_for(|phase| *phase == ManagerPhase::Running)
        .await?;

    assert!(workspaces.remove_workspace(root).await);
    assert!(!workspaces.remove_workspace(root).await, "already removed");
    assert!(workspaces.workspace_roots().is_empty());

    let summary = run.await??;
    assert_eq!(summary.state, RunnerState::Cancelled);
    assert_eq!(summary.stats.not_run, 5);
    Ok(())
}

#[tokio::test]
async fn status_updates_follow_a_run() -> Result<()> {
    let spawner = FakeSpawner::new(PYTEST_COLLECTION);
    let (tx, rx) = mpsc::unbounded_channel();
    let updater = StatusUpdaterService::spawn(Duration::from_millis(20), rx);
    let mut updates = updater.subscribe();

    let service = create_test_manager_service(
        "/workspace",
        context(&spawner, StaticSettings::default()).with_events(tx),
    );
    let manager = service.manager(TestProvider::Pytest)?;
    manager
        .run_tests(RunRequest::all(TestProvider::Pytest, "/workspace"))
        .await?;
    drop(manager);
    drop(service);
    updater.join().await;

    let mut changes = 0;
    let mut completions = Vec::new();
    while let Some(update) = updates.recv().await {
        match update {
            StatusUpdate::Changed(change) => {
                assert!(completions.is_empty(), "changes are flushed before the completion");
                assert_eq!(change.provider, TestProvider::Pytest);
                changes += 1;
            }
            StatusUpdate::RunCompleted(completion) => completions.push(completion),
        }
    }
    assert!(changes >= 1, "at least one coalesced change");
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].stats.not_run, 5);
    Ok(())
}
