// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `detest` command-line interface. For the detection engine itself see
//! the `detest-runner` crate.

mod dispatch;
pub mod output;

pub use dispatch::DetestApp;

use clap::Parser;
use color_eyre::Result;

/// Parses the command line and executes the selected subcommand.
pub fn main_impl() -> Result<()> {
    let app = DetestApp::parse();
    app.exec()
}
