// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ResultChannel, UnparsableLine};
use crate::{
    args::last_option_value,
    config::ProviderSettings,
    process::ProcessSpec,
    tree::DiscoveredTest,
};
use camino::Utf8PathBuf;

/// Collects tests with `unittest.TestLoader.discover` and prints them after a `start` marker.
const DISCOVERY_SCRIPT: &str = include_str!("../../scripts/unittest_discovery.py");

/// Runs the tests named in a targets file and streams results to a loopback socket.
const RUN_SCRIPT: &str = include_str!("../../scripts/unittest_runner.py");

const START_MARKER: &str = "start";

const DEFAULT_START_DIRECTORY: &str = ".";
const DEFAULT_PATTERN: &str = "test*.py";

/// Extracts the discovery options unittest understands, in normalized form.
pub(super) fn build_args(user_args: &[String]) -> Vec<String> {
    let start = last_option_value(user_args, &["-s", "--start-directory"])
        .unwrap_or_else(|| DEFAULT_START_DIRECTORY.to_owned());
    let pattern = last_option_value(user_args, &["-p", "--pattern"])
        .unwrap_or_else(|| DEFAULT_PATTERN.to_owned());
    let mut args = vec![
        "--start-directory".to_owned(),
        start,
        "--pattern".to_owned(),
        pattern,
    ];
    if let Some(top) = last_option_value(user_args, &["-t", "--top-level-directory"]) {
        args.push("--top-level-directory".to_owned());
        args.push(top);
    }
    args
}

pub(super) fn discovery_spec(settings: &ProviderSettings, args: Vec<String>) -> ProcessSpec {
    let mut spec = ProcessSpec::new(&settings.python, &settings.root_directory);
    spec.args(["-c", DISCOVERY_SCRIPT]).args(args);
    spec
}

pub(super) fn run_spec(
    settings: &ProviderSettings,
    args: Vec<String>,
    channel: &ResultChannel<'_>,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(&settings.python, &settings.root_directory);
    spec.args(["-c", RUN_SCRIPT]);
    if let ResultChannel::Socket { port, targets_file } = channel {
        spec.arg("--port")
            .arg(port.to_string())
            .arg("--targets")
            .arg(targets_file.as_str());
    }
    spec.args(args);
    spec
}

/// Parses discovery script output: `native-id<TAB>file<TAB>line` records after a `start` line.
pub(super) fn parse_collection(output: &str) -> Result<Vec<DiscoveredTest>, UnparsableLine> {
    let mut lines = output.lines().enumerate();
    // Anything printed while importing test modules comes before the marker.
    if !lines.any(|(_, line)| line.trim_end() == START_MARKER) {
        return Err(UnparsableLine {
            line_number: output.lines().count() + 1,
            line: String::new(),
            reason: "output ended before the `start` marker",
        });
    }

    let mut tests = Vec::new();
    for (index, line) in lines {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let unparsable = |reason| UnparsableLine {
            line_number: index + 1,
            line: line.to_owned(),
            reason,
        };

        let mut fields = line.split('\t');
        let (Some(native_id), Some(file), line_field) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(unparsable("expected `id<TAB>file<TAB>line`"));
        };

        // unittest ids are `module.Class.method`; the module may itself be dotted.
        let Some((rest, method)) = native_id.rsplit_once('.') else {
            return Err(unparsable("test id has no class"));
        };
        let Some((module, class)) = rest.rsplit_once('.') else {
            return Err(unparsable("test id has no module"));
        };
        if module.is_empty() || class.is_empty() || method.is_empty() || file.is_empty() {
            return Err(unparsable("test id has an empty component"));
        }

        let line_number = match line_field.map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(
                value
                    .parse::<u32>()
                    .map_err(|_| unparsable("invalid line number"))?,
            ),
        };

        tests.push(DiscoveredTest {
            file: Utf8PathBuf::from(file.replace('\\', "/")),
            qualified_name: vec![class.to_owned(), method.to_owned()],
            line: line_number,
            native_id: native_id.to_owned(),
            module: Some(module.to_owned()),
        });
    }
    Ok(tests)
}
