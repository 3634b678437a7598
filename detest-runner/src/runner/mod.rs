// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runners: isolated environments a test schedule can be executed in.
//!
//! A [`Runner`] owns one application instance (recreated between uses), an
//! optional driver, and a private network. The [`RunnerPool`] multiplexes a
//! bounded set of runners behind the [`Oracle`](crate::oracle::Oracle)
//! contract, resetting each runner after every use.

mod compose;
mod pool;

pub use compose::{ComposeRunner, ComposeRunnerBuilder};
pub use pool::{RunnerPool, DEFAULT_POOL_SIZE};

use crate::errors::RunnerError;
use std::future::Future;

/// One isolated execution environment.
///
/// Lifecycle: built, reset before first use, then alternating run/reset
/// until the pool destroys it. A runner is only ever used by one caller at
/// a time; the pool enforces this by moving runners through its channels.
pub trait Runner: Send + Sync + 'static {
    /// A token identifying this runner, of the form `runner-<k>`.
    fn id(&self) -> &str;

    /// Destroys the current application instance and brings up a fresh one,
    /// so the next run observes the initial application state.
    fn reset(&mut self) -> impl Future<Output = Result<(), RunnerError>> + Send;

    /// Runs a schedule and reports one boolean per test.
    fn run(&self, tests: &[String]) -> impl Future<Output = Result<Vec<bool>, RunnerError>> + Send;

    /// Releases every resource owned by the runner.
    fn destroy(self) -> impl Future<Output = Result<(), RunnerError>> + Send;
}
