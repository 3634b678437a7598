// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of detest output: colorization and log filtering.

use clap::{Args, ValueEnum};
use owo_colors::Style;
use std::{env, fmt, io, sync::Once};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

static INIT_LOGGER: Once = Once::new();

/// Output options shared by all subcommands.
#[derive(Copy, Clone, Debug, Args)]
#[must_use]
pub struct OutputOpts {
    /// Use verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// When to colorize output
    #[arg(long, global = true, value_enum, default_value_t, value_name = "WHEN")]
    pub color: Color,
}

impl OutputOpts {
    /// Installs the logging subscriber and returns the resulting context.
    pub fn init(self) -> OutputContext {
        let OutputOpts { verbose, color } = self;
        color.init(verbose);
        OutputContext { verbose, color }
    }
}

/// High level specification of detest output options.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    /// Request the output to be verbose.
    pub verbose: bool,

    /// Specify how colorization is determined.
    pub color: Color,
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
}

/// Specifies whether to colorize output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
#[must_use]
pub enum Color {
    /// Determine coloration from the terminal and the `NO_COLOR`
    /// environment variable
    #[default]
    Auto,

    /// Always try to colorize
    Always,

    /// Never try to colorize
    Never,
}

impl Color {
    fn init(self, verbose: bool) {
        INIT_LOGGER.call_once(|| {
            let level_str = env::var("DETEST_LOG").unwrap_or_default();

            // If the level string is empty, fall back on the standard
            // level filter.
            let targets = if level_str.is_empty() {
                let default = if verbose {
                    LevelFilter::DEBUG
                } else {
                    LevelFilter::INFO
                };
                Targets::new().with_default(default)
            } else {
                level_str.parse().expect("unable to parse DETEST_LOG")
            };

            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr)
                .with_ansi(self.should_colorize(supports_color::Stream::Stderr));

            tracing_subscriber::registry()
                .with(targets)
                .with(layer)
                .init();
        });
    }

    pub(crate) fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Color::Auto => "auto",
            Color::Always => "always",
            Color::Never => "never",
        };
        write!(f, "{value}")
    }
}

/// General stderr styles for user-facing messages.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) failure: Style,
    pub(crate) count: Style,
}

impl StderrStyles {
    fn colorize(&mut self) {
        self.failure = Style::new().red().bold();
        self.count = Style::new().bold();
    }
}
