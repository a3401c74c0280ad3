// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Looking up test managers by workspace root and provider.
//!
//! [`WorkspaceTestManagerService`] hands out one [`TestManagerService`] per workspace root, and
//! each of those lazily creates one [`TestManager`] per enabled provider. Managers are cached
//! until their workspace is removed.

use crate::{
    config::SettingsSource,
    errors::ManagerLookupError,
    events::ManagerEvent,
    manager::TestManager,
    process::{DebugLauncher, ProcessSpawner},
    provider::TestProvider,
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The collaborators shared by every manager.
#[derive(Clone, Debug)]
pub struct ManagerContext {
    /// Launches discovery and test processes.
    pub spawner: Arc<dyn ProcessSpawner>,

    /// Provides settings per workspace and provider.
    pub settings: Arc<dyn SettingsSource>,

    /// Where managers publish events, if anywhere.
    pub events: Option<mpsc::UnboundedSender<ManagerEvent>>,

    /// Launches debug runs. If unset, the configured debugger command is used.
    pub debug_launcher: Option<Arc<dyn DebugLauncher>>,

    /// How long a streaming test process has to finish sending results after it exits. If
    /// unset, the runner's default is used.
    pub connect_grace: Option<Duration>,
}

impl ManagerContext {
    /// Creates a new context.
    pub fn new(spawner: Arc<dyn ProcessSpawner>, settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            spawner,
            settings,
            events: None,
            debug_launcher: None,
            connect_grace: None,
        }
    }

    /// Publishes manager events to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Uses `launcher` for debug runs.
    pub fn with_debug_launcher(mut self, launcher: Arc<dyn DebugLauncher>) -> Self {
        self.debug_launcher = Some(launcher);
        self
    }

    /// Sets how long a streaming test process has to finish sending results after it exits.
    pub fn with_connect_grace(mut self, connect_grace: Duration) -> Self {
        self.connect_grace = Some(connect_grace);
        self
    }
}

/// Creates a test manager for `provider` in `workspace_root`.
pub fn create_test_manager(
    provider: TestProvider,
    workspace_root: impl Into<Utf8PathBuf>,
    ctx: &ManagerContext,
) -> TestManager {
    TestManager::new(provider, workspace_root, ctx)
}

/// Creates a service that manages every provider in `workspace_root`.
pub fn create_test_manager_service(
    workspace_root: impl Into<Utf8PathBuf>,
    ctx: ManagerContext,
) -> TestManagerService {
    TestManagerService {
        workspace_root: workspace_root.into(),
        ctx,
        managers: Mutex::new(IndexMap::new()),
    }
}

/// The managers for one workspace root, one per provider.
#[derive(Debug)]
pub struct TestManagerService {
    workspace_root: Utf8PathBuf,
    ctx: ManagerContext,
    managers: Mutex<IndexMap<TestProvider, Arc<TestManager>>>,
}

impl TestManagerService {
    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the manager for `provider`, creating it on first access.
    ///
    /// Fails if the provider is disabled for this workspace.
    pub fn manager(&self, provider: TestProvider) -> Result<Arc<TestManager>, ManagerLookupError> {
        let settings = self.ctx.settings.get_settings(&self.workspace_root, provider)?;
        if !settings.enabled {
            return Err(ManagerLookupError::ProviderDisabled {
                workspace_root: self.workspace_root.clone(),
                provider,
            });
        }
        Ok(self.get_or_create(provider))
    }

    /// Returns the managers for every enabled provider, in preference order.
    pub fn managers(&self) -> Result<IndexMap<TestProvider, Arc<TestManager>>, ManagerLookupError> {
        let mut managers = IndexMap::new();
        for provider in TestProvider::ALL {
            let settings = self.ctx.settings.get_settings(&self.workspace_root, provider)?;
            if settings.enabled {
                managers.insert(provider, self.get_or_create(provider));
            }
        }
        Ok(managers)
    }

    /// Returns the manager for the first enabled provider, if any.
    pub fn preferred_manager(&self) -> Result<Option<Arc<TestManager>>, ManagerLookupError> {
        Ok(self.managers()?.into_values().next())
    }

    /// Returns the managers created so far.
    pub fn cached_managers(&self) -> Vec<Arc<TestManager>> {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Stops any active runs in this workspace.
    pub async fn shutdown(&self) {
        for manager in self.cached_managers() {
            manager.stop_tests().await;
        }
    }

    fn get_or_create(&self, provider: TestProvider) -> Arc<TestManager> {
        let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);
        managers
            .entry(provider)
            .or_insert_with(|| {
                debug!("creating {provider} manager for {}", self.workspace_root);
                Arc::new(create_test_manager(
                    provider,
                    self.workspace_root.clone(),
                    &self.ctx,
                ))
            })
            .clone()
    }
}

/// Hands out a [`TestManagerService`] per workspace root.
#[derive(Debug)]
pub struct WorkspaceTestManagerService {
    ctx: ManagerContext,
    services: Mutex<IndexMap<Utf8PathBuf, Arc<TestManagerService>>>,
}

impl WorkspaceTestManagerService {
    /// Creates a new service. Every manager it creates shares `ctx`.
    pub fn new(ctx: ManagerContext) -> Self {
        Self {
            ctx,
            services: Mutex::new(IndexMap::new()),
        }
    }

    /// Returns the service for `workspace_root`, creating it on first access.
    pub fn service_for(&self, workspace_root: &Utf8Path) -> Arc<TestManagerService> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services
            .entry(workspace_root.to_owned())
            .or_insert_with(|| {
                Arc::new(create_test_manager_service(
                    workspace_root,
                    self.ctx.clone(),
                ))
            })
            .clone()
    }

    /// Returns the managers for every enabled provider in `workspace_root`.
    pub fn get_manager(
        &self,
        workspace_root: &Utf8Path,
    ) -> Result<IndexMap<TestProvider, Arc<TestManager>>, ManagerLookupError> {
        self.service_for(workspace_root).managers()
    }

    /// Returns the workspace roots seen so far.
    pub fn workspace_roots(&self) -> Vec<Utf8PathBuf> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Removes a workspace, stopping any active runs in it. Returns false if the workspace
    /// wasn't known.
    pub async fn remove_workspace(&self, workspace_root: &Utf8Path) -> bool {
        let removed = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(workspace_root);
        match removed {
            Some(service) => {
                info!("removing workspace {workspace_root}");
                service.shutdown().await;
                true
            }
            None => false,
        }
    }
}
