// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testmux.
//!
//! Settings are layered: the defaults embedded in the binary come first, followed by
//! `.config/testmux.toml` in the workspace root (if present) or an explicitly provided file.

use crate::{
    args::split_args,
    errors::{ConfigParseError, ConfigParseErrorKind},
    provider::TestProvider,
};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, warn};

/// Provides settings for a workspace and provider.
///
/// This is the seam through which managers read configuration. [`FileSettingsSource`] is the
/// standard implementation.
pub trait SettingsSource: fmt::Debug + Send + Sync {
    /// Returns the settings for `provider` in `workspace_root`.
    fn get_settings(
        &self,
        workspace_root: &Utf8Path,
        provider: TestProvider,
    ) -> Result<ProviderSettings, ConfigParseError>;
}

/// Resolved settings for one provider in one workspace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderSettings {
    /// The provider these settings are for.
    pub provider: TestProvider,

    /// Whether the provider is enabled.
    pub enabled: bool,

    /// User arguments for the framework.
    pub args: Vec<String>,

    /// The absolute directory tests are discovered and run from.
    pub root_directory: Utf8PathBuf,

    /// The Python interpreter.
    pub python: String,

    /// The debugger command line, if configured.
    pub debugger: Option<Vec<String>>,

    /// The overall timeout for discovery and runs.
    pub run_timeout: Duration,
}

/// Overall configuration for a workspace.
#[derive(Clone, Debug)]
pub struct TestmuxConfig {
    workspace_root: Utf8PathBuf,
    python: String,
    debugger: Option<Vec<String>>,
    run_timeout: Duration,
    status_debounce: Duration,
    providers: IndexMap<TestProvider, ProviderConfig>,
}

#[derive(Clone, Debug)]
struct ProviderConfig {
    enabled: bool,
    args: Vec<String>,
    root_directory: Utf8PathBuf,
}

impl TestmuxConfig {
    /// The default location of the config within the workspace root.
    pub const CONFIG_PATH: &'static str = ".config/testmux.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config for `workspace_root`.
    ///
    /// If `file` is `None`, `.config/testmux.toml` in the workspace root is used if it exists.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };
        let builder = Self::make_default_config().add_source(source);
        Self::build(workspace_root, &config_file, &builder)
    }

    /// Reads the config from a TOML string layered over the defaults.
    pub fn from_toml_str(
        workspace_root: impl Into<Utf8PathBuf>,
        toml: &str,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let builder =
            Self::make_default_config().add_source(File::from_str(toml, FileFormat::Toml));
        Self::build(workspace_root, Utf8Path::new("<inline>"), &builder)
    }

    /// Returns the default config for `workspace_root`.
    #[cfg(test)]
    pub(crate) fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self::build(
            workspace_root.into(),
            Utf8Path::new("<default config>"),
            &Self::make_default_config(),
        )
        .expect("default config is always valid")
    }

    /// Returns the workspace root this config was read for.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the debounce window for status updates.
    pub fn status_debounce(&self) -> Duration {
        self.status_debounce
    }

    /// Returns the overall timeout for discovery and runs.
    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Returns the providers enabled in this config, in preference order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = TestProvider> + '_ {
        self.providers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(&provider, _)| provider)
    }

    /// Returns resolved settings for `provider`.
    pub fn provider_settings(&self, provider: TestProvider) -> ProviderSettings {
        let (enabled, args, root_directory) = match self.providers.get(&provider) {
            Some(config) => (
                config.enabled,
                config.args.clone(),
                config.root_directory.clone(),
            ),
            None => (false, Vec::new(), self.workspace_root.clone()),
        };
        ProviderSettings {
            provider,
            enabled,
            args,
            root_directory,
            python: self.python.clone(),
            debugger: self.debugger.clone(),
            run_timeout: self.run_timeout,
        }
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build(
        workspace_root: Utf8PathBuf,
        config_file: &Utf8Path,
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<Self, ConfigParseError> {
        let (deserialized, unknown) = Self::build_and_deserialize_config(builder)
            .map_err(|kind| ConfigParseError::new(config_file, kind))?;
        if !unknown.is_empty() {
            let keys: Vec<_> = unknown.into_iter().collect();
            warn!(
                "ignoring unknown configuration keys in `{config_file}`: {}",
                keys.join(", ")
            );
        }

        let debugger = match deserialized.debugger {
            None => None,
            Some(ArgsValue::List(list)) => Some(list),
            Some(ArgsValue::String(command)) => Some(split_args(&command).map_err(|err| {
                ConfigParseError::new(
                    config_file,
                    ConfigParseErrorKind::DebuggerCommand { command, err },
                )
            })?),
        }
        .filter(|argv| !argv.is_empty());

        let mut providers = IndexMap::new();
        for (provider, table) in [
            (TestProvider::Pytest, deserialized.pytest),
            (TestProvider::Unittest, deserialized.unittest),
        ] {
            let args = match table.args {
                ArgsValue::List(list) => list,
                ArgsValue::String(args) => split_args(&args).map_err(|err| {
                    ConfigParseError::new(
                        config_file,
                        ConfigParseErrorKind::ProviderArgs { provider, args, err },
                    )
                })?,
            };
            let root_directory = resolve_root_directory(&workspace_root, &table.root_directory)
                .ok_or_else(|| {
                    ConfigParseError::new(
                        config_file,
                        ConfigParseErrorKind::RootDirectoryOutsideWorkspace {
                            provider,
                            root_directory: table.root_directory.clone(),
                        },
                    )
                })?;
            providers.insert(
                provider,
                ProviderConfig {
                    enabled: table.enabled,
                    args,
                    root_directory,
                },
            );
        }

        debug!(
            "loaded config for `{workspace_root}` (enabled providers: {:?})",
            providers
                .iter()
                .filter(|(_, config)| config.enabled)
                .map(|(provider, _)| provider.as_str())
                .collect::<Vec<_>>()
        );

        Ok(Self {
            workspace_root,
            python: deserialized.python,
            debugger,
            run_timeout: deserialized.run_timeout,
            status_debounce: deserialized.status_debounce,
            providers,
        })
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(TestmuxConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: TestmuxConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // The config crate reports the key too: drop it so the path is only printed once.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// Resolves `root_directory` against `workspace_root` lexically, returning `None` if the result
/// isn't inside the workspace.
fn resolve_root_directory(
    workspace_root: &Utf8Path,
    root_directory: &Utf8Path,
) -> Option<Utf8PathBuf> {
    let relative = if root_directory.is_absolute() {
        root_directory.strip_prefix(workspace_root).ok()?
    } else {
        root_directory
    };

    let mut resolved = workspace_root.to_owned();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                depth = depth.checked_sub(1)?;
                resolved.pop();
            }
            Utf8Component::Normal(part) => {
                depth += 1;
                resolved.push(part);
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Reads settings from config files, caching the parsed config per workspace.
#[derive(Debug, Default)]
pub struct FileSettingsSource {
    config_file: Option<Utf8PathBuf>,
    cache: Mutex<HashMap<Utf8PathBuf, Arc<TestmuxConfig>>>,
}

impl FileSettingsSource {
    /// Creates a new source that reads `.config/testmux.toml` from each workspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new source that reads an explicit config file for every workspace.
    pub fn with_config_file(config_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            config_file: Some(config_file.into()),
            cache: Mutex::default(),
        }
    }

    /// Returns the config for `workspace_root`, reading it if it isn't cached.
    pub fn config(
        &self,
        workspace_root: &Utf8Path,
    ) -> Result<Arc<TestmuxConfig>, ConfigParseError> {
        if let Some(config) = self.lock().get(workspace_root) {
            return Ok(config.clone());
        }
        // Parse outside the lock. Two racing readers produce identical configs.
        let config = Arc::new(TestmuxConfig::from_sources(
            workspace_root,
            self.config_file.as_deref(),
        )?);
        Ok(self
            .lock()
            .entry(workspace_root.to_owned())
            .or_insert(config)
            .clone())
    }

    /// Drops the cached config for `workspace_root`, so that the next read picks up changes.
    pub fn invalidate(&self, workspace_root: &Utf8Path) {
        self.lock().remove(workspace_root);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Utf8PathBuf, Arc<TestmuxConfig>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SettingsSource for FileSettingsSource {
    fn get_settings(
        &self,
        workspace_root: &Utf8Path,
        provider: TestProvider,
    ) -> Result<ProviderSettings, ConfigParseError> {
        Ok(self.config(workspace_root)?.provider_settings(provider))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TestmuxConfigDeserialize {
    python: String,
    #[serde(default)]
    debugger: Option<ArgsValue>,
    #[serde(with = "humantime_serde")]
    run_timeout: Duration,
    #[serde(with = "humantime_serde")]
    status_debounce: Duration,
    pytest: ProviderConfigDeserialize,
    unittest: ProviderConfigDeserialize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProviderConfigDeserialize {
    enabled: bool,
    args: ArgsValue,
    root_directory: Utf8PathBuf,
}

/// An argument list, written either as an array or as a single shell-quoted string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum ArgsValue {
    List(Vec<String>),
    String(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn default_config_is_valid() {
        let config = TestmuxConfig::default_config("/ws");
        assert_eq!(config.run_timeout(), Duration::from_secs(600));
        assert_eq!(config.status_debounce(), Duration::from_millis(200));
        assert_eq!(
            config.enabled_providers().collect::<Vec<_>>(),
            vec![TestProvider::Pytest]
        );

        let settings = config.provider_settings(TestProvider::Unittest);
        assert!(!settings.enabled);
        assert_eq!(settings.args, vec!["-s", ".", "-p", "test*.py"]);
        assert_eq!(settings.root_directory, Utf8PathBuf::from("/ws"));
        assert_eq!(settings.python, "python");
        assert_eq!(settings.debugger, None);
    }

    #[test]
    fn overrides_layer_over_defaults() {
        let config = TestmuxConfig::from_toml_str(
            "/ws",
            indoc! {r#"
                python = "/usr/bin/python3"
                debugger = "python -m debugpy --listen 5678 --wait-for-client"
                run-timeout = "30s"

                [pytest]
                args = "-p no:cacheprovider -k 'not slow'"
                root-directory = "src/./tests"

                [unittest]
                enabled = true
            "#},
        )
        .expect("valid config");

        let pytest = config.provider_settings(TestProvider::Pytest);
        assert_eq!(pytest.python, "/usr/bin/python3");
        assert_eq!(pytest.run_timeout, Duration::from_secs(30));
        assert_eq!(pytest.args, vec!["-p", "no:cacheprovider", "-k", "not slow"]);
        assert_eq!(pytest.root_directory, Utf8PathBuf::from("/ws/src/tests"));
        assert_eq!(
            pytest.debugger.as_deref(),
            Some(
                &[
                    "python".to_owned(),
                    "-m".to_owned(),
                    "debugpy".to_owned(),
                    "--listen".to_owned(),
                    "5678".to_owned(),
                    "--wait-for-client".to_owned(),
                ][..]
            )
        );

        // Unspecified keys in a table keep their defaults.
        let unittest = config.provider_settings(TestProvider::Unittest);
        assert!(unittest.enabled);
        assert_eq!(unittest.args, vec!["-s", ".", "-p", "test*.py"]);
        assert_eq!(
            config.enabled_providers().collect::<Vec<_>>(),
            vec![TestProvider::Pytest, TestProvider::Unittest]
        );
    }

    #[test_case("..", false ; "parent of workspace")]
    #[test_case("a/../../b", false ; "escapes through parent")]
    #[test_case("/elsewhere", false ; "absolute outside")]
    #[test_case("/ws/tests", true ; "absolute inside")]
    #[test_case("a/../b", true ; "parent within workspace")]
    fn root_directory_must_be_inside_workspace(root: &str, valid: bool) {
        let toml = format!("[pytest]\nroot-directory = \"{root}\"\n");
        let result = TestmuxConfig::from_toml_str("/ws", &toml);
        match (result, valid) {
            (Ok(_), true) => {}
            (Err(error), false) => assert!(
                matches!(
                    error.kind(),
                    ConfigParseErrorKind::RootDirectoryOutsideWorkspace { .. }
                ),
                "unexpected error kind: {:?}",
                error.kind()
            ),
            (Ok(_), false) => panic!("root directory {root} should be rejected"),
            (Err(error), true) => panic!("root directory {root} should be accepted: {error}"),
        }
    }

    #[test]
    fn invalid_duration_reports_path() {
        let error = TestmuxConfig::from_toml_str("/ws", "run-timeout = \"soon\"\n")
            .expect_err("invalid duration");
        match error.kind() {
            ConfigParseErrorKind::DeserializeError(error) => {
                assert_eq!(error.path().to_string(), "run-timeout");
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn unbalanced_quotes_in_args() {
        let error = TestmuxConfig::from_toml_str("/ws", "[pytest]\nargs = \"-k 'oops\"\n")
            .expect_err("unbalanced quote");
        assert!(matches!(
            error.kind(),
            ConfigParseErrorKind::ProviderArgs {
                provider: TestProvider::Pytest,
                ..
            }
        ));
    }
}
