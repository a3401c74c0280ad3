// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ResultChannel, UnparsableLine};
use crate::{
    args::{ArgsMode, filter_arguments, remove_positional_arguments},
    config::ProviderSettings,
    process::ProcessSpec,
    tree::{DiscoveredTest, split_qualified},
};
use camino::Utf8PathBuf;

/// pytest's exit code when no tests were collected.
pub(super) const NO_TESTS_COLLECTED: i32 = 5;

/// Options that take a value, as far as argument filtering is concerned.
const OPTIONS_WITH_ARGS: &[&str] = &[
    "-c",
    "-k",
    "-m",
    "-n",
    "-o",
    "-p",
    "-W",
    "--basetemp",
    "--confcutdir",
    "--cov-config",
    "--cov-fail-under",
    "--cov-report",
    "--deselect",
    "--ignore",
    "--ignore-glob",
    "--junit-prefix",
    "--junit-xml",
    "--junitxml",
    "--maxfail",
    "--numprocesses",
    "--override-ini",
    "--rootdir",
    "--tb",
];

/// Options that only matter when running tests, dropped for discovery.
const RUN_ONLY_WITH_ARGS: &[&str] = &[
    "-n",
    "--numprocesses",
    "--maxfail",
    "--junit-xml",
    "--junitxml",
    "--junit-prefix",
    "--cov-config",
    "--cov-fail-under",
    "--cov-report",
];

const RUN_ONLY_FLAGS: &[&str] = &[
    "-x",
    "--exitfirst",
    "--lf",
    "--last-failed",
    "--ff",
    "--failed-first",
    "--sw",
    "--stepwise",
    "--pdb",
    "--cov*",
    "--no-cov",
];

/// Options that change the collection listing format, dropped for discovery.
const OUTPUT_FLAGS: &[&str] = &["-q*", "-v*", "--quiet", "--verbose", "--collect-only", "--co"];

pub(super) fn build_args(
    user_args: &[String],
    mode: ArgsMode,
    subset: Option<&[String]>,
) -> Vec<String> {
    match mode {
        ArgsMode::Discover => {
            let flags: Vec<&str> = RUN_ONLY_FLAGS.iter().chain(OUTPUT_FLAGS).copied().collect();
            // The rootdir is always set by testmux.
            let with_args: Vec<&str> = RUN_ONLY_WITH_ARGS
                .iter()
                .chain(&["--rootdir"])
                .copied()
                .collect();
            filter_arguments(user_args, &with_args, &flags)
        }
        ArgsMode::Run => {
            let filtered = filter_arguments(
                user_args,
                &["--junit-xml", "--junitxml", "--rootdir"],
                &["--collect-only", "--co"],
            );
            match subset {
                Some(node_ids) => {
                    let mut args = remove_positional_arguments(&filtered, OPTIONS_WITH_ARGS);
                    args.extend(node_ids.iter().cloned());
                    args
                }
                None => filtered,
            }
        }
    }
}

pub(super) fn discovery_spec(settings: &ProviderSettings, args: Vec<String>) -> ProcessSpec {
    let mut spec = ProcessSpec::new(&settings.python, &settings.root_directory);
    spec.args(["-m", "pytest", "--collect-only", "-q", "--rootdir"])
        .arg(settings.root_directory.as_str())
        .args(args);
    spec
}

pub(super) fn run_spec(
    settings: &ProviderSettings,
    args: Vec<String>,
    channel: &ResultChannel<'_>,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(&settings.python, &settings.root_directory);
    spec.args(["-m", "pytest", "--rootdir"])
        .arg(settings.root_directory.as_str());
    if let ResultChannel::Report { path } = channel {
        // xunit1 reports carry the `file` and `line` attributes used to rebuild node ids.
        spec.arg(format!("--junit-xml={path}"))
            .args(["-o", "junit_family=xunit1"]);
    }
    // Test selection comes last so that option values can't swallow a node id.
    spec.args(args);
    spec
}

/// Parses the output of `pytest --collect-only -q`: one node id per line, followed by a blank
/// line and a summary.
pub(super) fn parse_collection(output: &str) -> Result<Vec<DiscoveredTest>, UnparsableLine> {
    let mut tests = Vec::new();
    for (index, line) in output.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let unparsable = |reason| UnparsableLine {
            line_number: index + 1,
            line: line.to_owned(),
            reason,
        };

        let mut parts = split_qualified(line).into_iter();
        let file = parts.next().unwrap_or_default();
        let qualified_name: Vec<String> = parts.map(str::to_owned).collect();
        if file.is_empty() || qualified_name.is_empty() {
            return Err(unparsable("expected a node id of the form `path::name`"));
        }
        if qualified_name.iter().any(String::is_empty) {
            return Err(unparsable("node id has an empty name component"));
        }

        tests.push(DiscoveredTest {
            file: Utf8PathBuf::from(file),
            qualified_name,
            line: None,
            native_id: line.to_owned(),
            module: None,
        });
    }
    Ok(tests)
}
