// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collecting tests into a canonical tree.

use crate::{
    config::ProviderSettings,
    errors::{DiscoverTestsError, DiscoveryError},
    process::ProcessSpawner,
    provider::{TestProvider, UnparsableLine},
    stopwatch::stopwatch,
    tree::{FlatIndex, FlatteningVisitor, TestTree, TestTreeBuilder},
};
use std::sync::Arc;
use tracing::{debug, info};

/// A freshly discovered tree, with its index.
#[derive(Clone, Debug)]
pub struct DiscoveredTree {
    /// The tree.
    pub tree: TestTree,

    /// The index over `tree`.
    pub index: FlatIndex,
}

/// Runs a provider's collection command and turns its output into a [`TestTree`].
#[derive(Clone, Debug)]
pub struct DiscoveryService {
    provider: TestProvider,
    spawner: Arc<dyn ProcessSpawner>,
}

impl DiscoveryService {
    /// Creates a new discovery service for `provider`.
    pub fn new(provider: TestProvider, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { provider, spawner }
    }

    /// Returns the provider this service discovers tests for.
    pub fn provider(&self) -> TestProvider {
        self.provider
    }

    /// Discovers tests under `settings.root_directory`.
    ///
    /// Every call produces a fresh tree. Collecting an unchanged codebase twice produces trees
    /// with the same shape and ids.
    pub async fn discover(
        &self,
        settings: &ProviderSettings,
    ) -> Result<DiscoveredTree, DiscoverTestsError> {
        let provider = self.provider;
        let spec = provider.discovery_spec(settings);
        let stopwatch = stopwatch();
        debug!("{provider}: collecting tests with `{}`", spec.display_command());

        let mut child = self.spawner.spawn(&spec)?;
        let output = match tokio::time::timeout(settings.run_timeout, child.wait()).await {
            Ok(result) => result.map_err(|err| DiscoveryError::Wait { provider, err })?,
            Err(_) => {
                child.kill().await;
                return Err(DiscoveryError::TimedOut {
                    provider,
                    timeout: settings.run_timeout,
                }
                .into());
            }
        };

        let mut builder = TestTreeBuilder::new(&settings.root_directory);
        if provider.is_empty_collection(output.exit_code) {
            debug!("{provider}: no tests collected");
        } else if !output.success() {
            return Err(DiscoveryError::ProcessFailed {
                provider,
                exit_code: output.exit_code,
                stderr: output.stderr_lossy(),
            }
            .into());
        } else {
            let stdout = std::str::from_utf8(&output.stdout)
                .map_err(|_| DiscoveryError::NonUtf8Output { provider })?;
            let tests = provider.parse_discovery_output(stdout).map_err(
                |UnparsableLine {
                     line_number,
                     line,
                     reason,
                 }| DiscoveryError::Unparsable {
                    provider,
                    line_number,
                    line,
                    reason,
                    stderr: output.stderr_lossy(),
                },
            )?;
            for test in tests {
                builder.add_test(test);
            }
        }

        let tree = builder.build();
        let index = FlatteningVisitor::flatten(&tree)?;
        info!(
            "{provider}: discovered {} tests in {} ({:.2}s)",
            index.leaves().len(),
            settings.root_directory,
            stopwatch.snapshot().duration.as_secs_f64(),
        );
        Ok(DiscoveredTree { tree, index })
    }
}
