// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writing discovery listings, status updates and run summaries to stdout.

use crate::{
    errors::{ExpectedError, Result},
    output::StatusStyles,
};
use clap::ValueEnum;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use std::{io::Write, time::Duration};
use swrite::{SWrite, swrite};
use testmux_runner::{
    helpers::plural,
    manager::RunSummary,
    provider::TestProvider,
    status::StatusUpdate,
    tree::{NodeIndex, TestStatus, TestTree},
};

/// The format results are written in.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum MessageFormat {
    /// Human-readable output.
    #[default]
    Human,

    /// One JSON object per line.
    Json,
}

/// Writes results to `writer`.
pub(crate) struct Reporter<W> {
    format: MessageFormat,
    styles: StatusStyles,
    verbose: bool,
    writer: W,
}

impl<W: Write> Reporter<W> {
    pub(crate) fn new(
        format: MessageFormat,
        styles: StatusStyles,
        verbose: bool,
        writer: W,
    ) -> Self {
        Self {
            format,
            styles,
            verbose,
            writer,
        }
    }

    /// Writes the tree discovered for `provider`.
    pub(crate) fn report_tree(&mut self, provider: TestProvider, tree: &TestTree) -> Result<()> {
        match self.format {
            MessageFormat::Human => {
                writeln!(
                    self.writer,
                    "{} {} in {}:",
                    provider.style(self.styles.count),
                    "tests".style(self.styles.dimmed),
                    tree.root_dir(),
                )
                .map_err(write_error)?;
                write!(self.writer, "{}", tree.display()).map_err(write_error)?;
            }
            MessageFormat::Json => {
                for leaf in tree.leaves_under(NodeIndex::ROOT) {
                    let node = tree.node(leaf);
                    let line = json!({
                        "type": "test",
                        "provider": provider,
                        "id": node.id(),
                        "native": node.native_id(),
                        "file": node.file(),
                        "line": node.line(),
                        "status": node.status(),
                    });
                    self.write_json(&line)?;
                }
            }
        }
        self.flush()
    }

    /// Writes a coalesced status update.
    ///
    /// Human output only shows changes in verbose mode; completions are shown as summaries.
    pub(crate) fn report_update(&mut self, update: &StatusUpdate) -> Result<()> {
        match (self.format, update) {
            (MessageFormat::Json, update) => {
                self.write_json(update)?;
                self.flush()
            }
            (MessageFormat::Human, StatusUpdate::Changed(change)) if self.verbose => {
                writeln!(
                    self.writer,
                    "{}: {} {} updated, overall {}",
                    change.provider,
                    change.affected.len().style(self.styles.count),
                    plural::nodes_str(change.affected.len()),
                    change
                        .root_status
                        .style(self.styles.for_status(change.root_status)),
                )
                .map_err(write_error)?;
                self.flush()
            }
            (MessageFormat::Human, _) => Ok(()),
        }
    }

    /// Writes the outcome of a run: failing tests first, then counts.
    pub(crate) fn report_summary(
        &mut self,
        provider: TestProvider,
        summary: &RunSummary,
        tree: Option<&TestTree>,
    ) -> Result<()> {
        if self.format == MessageFormat::Json {
            // Completions were already written as status updates.
            return Ok(());
        }

        if let Some(tree) = tree {
            for leaf in tree.leaves_under(NodeIndex::ROOT) {
                let node = tree.node(leaf);
                let status = node.status();
                if !matches!(status, TestStatus::Fail | TestStatus::Error) {
                    continue;
                }
                write!(
                    self.writer,
                    "{:>8} ",
                    status_label(status).style(self.styles.for_status(status))
                )
                .map_err(write_error)?;
                if let Some(duration) = node.last_run().duration {
                    write!(self.writer, "[{}] ", format_duration(duration)).map_err(write_error)?;
                }
                write!(self.writer, "{}", node.id()).map_err(write_error)?;
                if let Some(message) = &node.last_run().message {
                    let first_line = message.lines().next().unwrap_or_default();
                    write!(self.writer, ": {}", first_line.style(self.styles.dimmed))
                        .map_err(write_error)?;
                }
                writeln!(self.writer).map_err(write_error)?;
            }
        }

        if let Some(process_error) = &summary.process_error {
            let code = match process_error.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_owned(),
            };
            writeln!(
                self.writer,
                "{}: test process exited with {code}",
                "warning".style(self.styles.skip),
            )
            .map_err(write_error)?;
            for line in process_error.stderr.lines().take(STDERR_TAIL_LINES) {
                writeln!(self.writer, "  {}", line.style(self.styles.dimmed)).map_err(write_error)?;
            }
        }
        if let Some(incomplete) = &summary.incomplete {
            writeln!(
                self.writer,
                "{}: {incomplete}",
                "warning".style(self.styles.skip),
            )
            .map_err(write_error)?;
        }

        let label = if summary.timed_out {
            "TIMEOUT"
        } else {
            summary.state.as_str()
        };
        writeln!(
            self.writer,
            "{:>12} [{}] {provider}: {}",
            label.to_uppercase().style(self.styles.count),
            format_duration(summary.elapsed),
            self.stats_line(summary),
        )
        .map_err(write_error)?;
        self.flush()
    }

    fn stats_line(&self, summary: &RunSummary) -> String {
        let stats = &summary.stats;
        let total = stats.total();
        let mut line = format!(
            "{} {} run: {} passed",
            total.style(self.styles.count),
            plural::tests_str(total),
            stats.passed.style(self.styles.pass),
        );
        for (count, label, style) in [
            (stats.failed, "failed", self.styles.fail),
            (stats.errored, "errored", self.styles.error),
            (stats.skipped, "skipped", self.styles.skip),
            (stats.not_run, "not run", self.styles.pending),
        ] {
            if count > 0 {
                swrite!(line, ", {} {label}", count.style(style));
            }
        }
        line
    }

    fn write_json(&mut self, value: &impl Serialize) -> Result<()> {
        serde_json::to_writer(&mut self.writer, value)
            .map_err(|err| ExpectedError::SerializeOutput { err })?;
        writeln!(self.writer).map_err(write_error)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(write_error)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}

const STDERR_TAIL_LINES: usize = 20;

fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Fail => "FAIL",
        TestStatus::Error => "ERROR",
        TestStatus::Pass => "PASS",
        TestStatus::Skip => "SKIP",
        TestStatus::NotRun => "NOT RUN",
        TestStatus::Running => "RUNNING",
        TestStatus::Idle | TestStatus::Discovered => "IDLE",
    }
}

fn format_duration(duration: Duration) -> String {
    format!("{:>8.3}s", duration.as_secs_f64())
}

fn write_error(err: std::io::Error) -> ExpectedError {
    ExpectedError::WriteOutput { err }
}
