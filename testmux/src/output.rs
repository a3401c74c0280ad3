// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ExpectedError;
use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::fmt;
use testmux_runner::tree::TestStatus;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding log directives, in `tracing_subscriber::filter::Targets`
/// syntax.
pub(crate) const LOG_ENV: &str = "TESTMUX_LOG";

/// Log events with this target are printed without a level heading.
pub(crate) const NO_HEADING_TARGET: &str = "testmux::no_heading";

pub(crate) mod clap_styles {
    use clap::builder::{
        Styles,
        styling::{AnsiColor, Effects, Style},
    };

    const HEADER: Style = AnsiColor::Green.on_default().effects(Effects::BOLD);
    const USAGE: Style = AnsiColor::Green.on_default().effects(Effects::BOLD);
    const LITERAL: Style = AnsiColor::Cyan.on_default().effects(Effects::BOLD);
    const PLACEHOLDER: Style = AnsiColor::Cyan.on_default();
    const ERROR: Style = AnsiColor::Red.on_default().effects(Effects::BOLD);
    const VALID: Style = AnsiColor::Cyan.on_default().effects(Effects::BOLD);
    const INVALID: Style = AnsiColor::Yellow.on_default().effects(Effects::BOLD);

    pub(crate) const fn style() -> Styles {
        Styles::styled()
            .header(HEADER)
            .usage(USAGE)
            .literal(LITERAL)
            .placeholder(PLACEHOLDER)
            .error(ERROR)
            .valid(VALID)
            .invalid(INVALID)
    }
}

#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub(crate) struct OutputOpts {
    /// Verbose output
    #[arg(long, short, global = true, env = "TESTMUX_VERBOSE")]
    pub(crate) verbose: bool,

    /// Produce color output: auto, always, never
    #[arg(
        long,
        value_enum,
        default_value_t,
        hide_possible_values = true,
        global = true,
        value_name = "WHEN",
        env = "TESTMUX_COLOR"
    )]
    pub(crate) color: Color,
}

impl OutputOpts {
    pub(crate) fn init(self) -> Result<OutputContext, ExpectedError> {
        let OutputOpts { verbose, color } = self;
        color.init(verbose)?;
        Ok(OutputContext { verbose, color })
    }
}

/// Output settings shared by every command.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: Color,
}

impl OutputContext {
    /// Returns general stderr styles for the current output context.
    pub fn stderr_styles(&self) -> StderrStyles {
        let mut styles = StderrStyles::default();
        if self.color.should_colorize(supports_color::Stream::Stderr) {
            styles.colorize();
        }
        styles
    }

    /// Returns styles for results written to stdout.
    pub(crate) fn stdout_styles(&self) -> StatusStyles {
        let mut styles = StatusStyles::default();
        if self.color.should_colorize(supports_color::Stream::Stdout) {
            styles.colorize();
        }
        styles
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Default)]
#[must_use]
pub(crate) enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

static INIT_LOGGER: std::sync::Once = std::sync::Once::new();

impl Color {
    fn init(self, verbose: bool) -> Result<(), ExpectedError> {
        match self {
            Color::Auto => owo_colors::unset_override(),
            Color::Always => owo_colors::set_override(true),
            Color::Never => owo_colors::set_override(false),
        }

        let mut log_styles = LogStyles::default();
        if self.should_colorize(supports_color::Stream::Stderr) {
            log_styles.colorize();
        }

        let targets = log_targets(std::env::var(LOG_ENV).ok().as_deref(), verbose)?;
        INIT_LOGGER.call_once(|| {
            let layer = tracing_subscriber::fmt::layer()
                .event_format(SimpleFormatter { styles: log_styles })
                .with_writer(std::io::stderr)
                .with_filter(targets);
            tracing_subscriber::registry().with(layer).init();
        });
        Ok(())
    }

    pub(crate) fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Parses log directives. An unset or empty value uses the default level.
fn log_targets(value: Option<&str>, verbose: bool) -> Result<Targets, ExpectedError> {
    match value {
        Some(value) if !value.is_empty() => {
            value
                .parse()
                .map_err(|err| ExpectedError::LogFilterParse {
                    value: value.to_owned(),
                    err,
                })
        }
        _ => {
            let level = if verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            };
            Ok(Targets::new().with_default(level))
        }
    }
}

struct SimpleFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        if metadata.target() != NO_HEADING_TARGET {
            let (heading, style) = match *metadata.level() {
                Level::ERROR => ("error", self.styles.error),
                Level::WARN => ("warning", self.styles.warning),
                Level::INFO => ("info", self.styles.info),
                Level::DEBUG => ("debug", self.styles.debug),
                Level::TRACE => ("trace", self.styles.trace),
            };
            write!(writer, "{}: ", heading.style(style))?;
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            error: None,
        };
        event.record(&mut visitor);
        if let Some(error) = visitor.error {
            return Err(error);
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            if let Err(error) = write!(self.writer, "{value:?}") {
                self.error = Some(error);
            }
        }
    }
}

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    info: Style,
    debug: Style,
    trace: Style,
}

impl LogStyles {
    fn colorize(&mut self) {
        self.error = style().red().bold();
        self.warning = style().yellow().bold();
        self.info = style().bold();
        self.debug = style().bold();
        self.trace = style().dimmed();
    }
}

/// Styles for messages written to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning_text: Style,
}

impl StderrStyles {
    fn colorize(&mut self) {
        self.bold = style().bold();
        self.warning_text = style().yellow();
    }
}

/// Styles for test statuses and summaries.
#[derive(Clone, Debug, Default)]
pub(crate) struct StatusStyles {
    pub(crate) pass: Style,
    pub(crate) fail: Style,
    pub(crate) skip: Style,
    pub(crate) error: Style,
    pub(crate) pending: Style,
    pub(crate) count: Style,
    pub(crate) dimmed: Style,
}

impl StatusStyles {
    fn colorize(&mut self) {
        self.pass = style().green().bold();
        self.fail = style().red().bold();
        self.skip = style().yellow().bold();
        self.error = style().magenta().bold();
        self.pending = style().dimmed();
        self.count = style().bold();
        self.dimmed = style().dimmed();
    }

    pub(crate) fn for_status(&self, status: TestStatus) -> Style {
        match status {
            TestStatus::Pass => self.pass,
            TestStatus::Fail => self.fail,
            TestStatus::Skip => self.skip,
            TestStatus::Error => self.error,
            TestStatus::Running
            | TestStatus::NotRun
            | TestStatus::Idle
            | TestStatus::Discovered => self.pending,
        }
    }
}
