// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and command execution.

use crate::{
    errors::{ExpectedError, Result},
    output::{OutputContext, OutputOpts},
    reporter::{MessageFormat, Reporter},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use std::{io::BufWriter, sync::Arc};
use testmux_runner::{
    config::{FileSettingsSource, SettingsSource},
    manager::{RunRequest, RunSummary, TestManager},
    process::TokioSpawner,
    provider::TestProvider,
    runner::RunnerState,
    service::{ManagerContext, TestManagerService, create_test_manager_service},
    signal::SignalHandlerKind,
    status::StatusUpdaterService,
    tree::StableId,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Discover and run Python tests through one test tree.
///
/// testmux drives pytest and unittest, keeps their results in a single tree, and reports
/// progress as tests finish.
#[derive(Debug, Parser)]
#[command(
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct TestmuxApp {
    #[clap(flatten)]
    common: CommonOpts,

    #[clap(subcommand)]
    command: Command,
}

impl TestmuxApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> Result<OutputContext> {
        self.common.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        let workspace_root = self.common.workspace_root()?;
        let settings = Arc::new(match &self.common.config_file {
            Some(config_file) => FileSettingsSource::with_config_file(config_file),
            None => FileSettingsSource::new(),
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testmux-worker")
            .build()
            .map_err(|err| ExpectedError::TokioRuntimeCreate { err })?;

        let app = BaseApp {
            workspace_root,
            settings,
            output,
        };
        runtime.block_on(async move {
            match self.command {
                Command::Discover(opts) => app.exec_discover(opts).await,
                Command::Run(opts) => app.exec_run(opts).await,
                Command::ListProviders => app.exec_list_providers(),
            }
        })
    }
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Workspace root [default: current directory]
    #[arg(long, global = true, value_name = "DIR", env = "TESTMUX_WORKSPACE")]
    workspace: Option<Utf8PathBuf>,

    /// Config file [default: <workspace>/.config/testmux.toml]
    #[arg(long, global = true, value_name = "PATH", env = "TESTMUX_CONFIG")]
    config_file: Option<Utf8PathBuf>,

    #[clap(flatten)]
    output: OutputOpts,
}

impl CommonOpts {
    fn workspace_root(&self) -> Result<Utf8PathBuf> {
        if let Some(workspace) = &self.workspace {
            return Ok(workspace.clone());
        }
        let current_dir =
            std::env::current_dir().map_err(|err| ExpectedError::CurrentDir { err })?;
        Utf8PathBuf::try_from(current_dir).map_err(|err| ExpectedError::WorkspaceRootInvalidUtf8 {
            path: err.into_path_buf(),
        })
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover tests and print the test tree
    Discover(DiscoverOpts),

    /// Run tests and report results
    ///
    /// Arguments after `--` replace the configured framework arguments for this run.
    Run(RunOpts),

    /// List providers and whether they're enabled for the workspace
    ListProviders,
}

#[derive(Debug, Args)]
struct ProviderOpts {
    /// Only use this provider [default: all enabled providers]
    #[arg(long, short)]
    provider: Option<TestProvider>,

    /// Output format
    #[arg(long, value_enum, default_value_t, value_name = "FORMAT")]
    message_format: MessageFormat,
}

#[derive(Debug, Args)]
struct DiscoverOpts {
    #[clap(flatten)]
    provider_opts: ProviderOpts,
}

#[derive(Debug, Args)]
struct RunOpts {
    #[clap(flatten)]
    provider_opts: ProviderOpts,

    /// Run only these tests, or every test under these suites, files or folders
    #[arg(long = "id", value_name = "ID")]
    ids: Vec<String>,

    /// Run the test process under the configured debugger
    #[arg(long)]
    debug: bool,

    /// Framework arguments for this run
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,
}

impl RunOpts {
    fn request(&self, provider: TestProvider, workspace_root: &Utf8Path) -> RunRequest {
        let mut request = RunRequest::all(provider, workspace_root).with_debug(self.debug);
        if !self.ids.is_empty() {
            request = request.with_subset(self.ids.iter().map(StableId::new));
        }
        if !self.args.is_empty() {
            request = request.with_args_override(self.args.clone());
        }
        request
    }
}

struct BaseApp {
    workspace_root: Utf8PathBuf,
    settings: Arc<FileSettingsSource>,
    output: OutputContext,
}

impl BaseApp {
    fn context(&self) -> ManagerContext {
        ManagerContext::new(Arc::new(TokioSpawner::new()), self.settings.clone())
    }

    fn reporter(&self, format: MessageFormat) -> Reporter<BufWriter<std::io::Stdout>> {
        Reporter::new(
            format,
            self.output.stdout_styles(),
            self.output.verbose,
            BufWriter::new(std::io::stdout()),
        )
    }

    fn managers(
        &self,
        service: &TestManagerService,
        provider: Option<TestProvider>,
    ) -> Result<IndexMap<TestProvider, Arc<TestManager>>> {
        let managers = match provider {
            Some(provider) => IndexMap::from([(provider, service.manager(provider)?)]),
            None => service.managers()?,
        };
        if managers.is_empty() {
            return Err(ExpectedError::NoProvidersEnabled {
                workspace_root: self.workspace_root.clone(),
            });
        }
        Ok(managers)
    }

    async fn exec_discover(&self, opts: DiscoverOpts) -> Result<i32> {
        let ProviderOpts {
            provider,
            message_format,
        } = opts.provider_opts;
        let service = create_test_manager_service(&self.workspace_root, self.context());
        let mut reporter = self.reporter(message_format);

        for (provider, manager) in self.managers(&service, provider)? {
            manager
                .discover_tests()
                .await
                .map_err(|err| ExpectedError::discovery(provider, err))?;
            if let Some(result) =
                manager.with_tree(|tree, _| reporter.report_tree(provider, tree))
            {
                result?;
            }
        }
        Ok(0)
    }

    async fn exec_run(&self, opts: RunOpts) -> Result<i32> {
        let debounce = self.settings.config(&self.workspace_root)?.status_debounce();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let updater = StatusUpdaterService::spawn(debounce, events_rx);
        let mut updates = updater.subscribe();

        let mut reporter = self.reporter(opts.provider_opts.message_format);
        let printer = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                reporter.report_update(&update)?;
            }
            Ok::<_, ExpectedError>(reporter)
        });

        let service = Arc::new(create_test_manager_service(
            &self.workspace_root,
            self.context().with_events(events_tx),
        ));
        let managers = self.managers(&service, opts.provider_opts.provider)?;

        let mut signal_handler = SignalHandlerKind::Standard.build()?;
        let signal_task = tokio::spawn({
            let service = service.clone();
            async move {
                while let Some(event) = signal_handler.recv().await {
                    warn!("received {event}, stopping tests");
                    service.shutdown().await;
                }
            }
        });

        let mut results = Vec::new();
        for (provider, manager) in &managers {
            let provider = *provider;
            let result = manager
                .run_tests(opts.request(provider, &self.workspace_root))
                .await
                .map_err(|err| ExpectedError::run_tests(provider, err));
            let stopped = matches!(&result, Ok(summary) if summary.state == RunnerState::Cancelled);
            results.push((provider, result));
            if stopped {
                info!("run was stopped, skipping remaining providers");
                break;
            }
        }

        // The updater flushes and exits once every event sender is gone.
        signal_task.abort();
        let _ = signal_task.await;
        let trees: IndexMap<TestProvider, _> = managers
            .iter()
            .map(|(provider, manager)| (*provider, manager.tree_snapshot()))
            .collect();
        drop(managers);
        drop(service);
        updater.join().await;
        let mut reporter = match printer.await {
            Ok(reporter) => reporter?,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        };

        let mut failed = false;
        let mut ran = 0;
        for (provider, result) in results {
            let summary = result?;
            let tree = trees.get(&provider).and_then(Option::as_ref);
            reporter.report_summary(provider, &summary, tree)?;
            failed |= !is_success(&summary);
            ran += summary.stats.total();
        }

        if failed {
            Err(ExpectedError::TestRunFailed)
        } else if ran == 0 {
            Err(ExpectedError::NoTestsRun)
        } else {
            Ok(0)
        }
    }

    fn exec_list_providers(&self) -> Result<i32> {
        for provider in TestProvider::ALL {
            let settings = self.settings.get_settings(&self.workspace_root, provider)?;
            println!(
                "{provider:<10} {:<9} {:<10} {}",
                if settings.enabled { "enabled" } else { "disabled" },
                provider.ingestion(),
                settings.root_directory,
            );
        }
        Ok(0)
    }
}

fn is_success(summary: &RunSummary) -> bool {
    summary.state == RunnerState::Completed
        && summary.stats.is_success()
        && summary.process_error.is_none()
        && summary.incomplete.is_none()
}
