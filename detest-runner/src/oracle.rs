// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The contract between the detection algorithms and the runner pool.

use crate::errors::OracleError;
use std::{future::Future, time::Duration};

/// The outcome of running one schedule.
#[derive(Clone, Debug)]
pub struct RunResults {
    /// One entry per test of the schedule, in order; `true` means the test
    /// passed.
    pub results: Vec<bool>,
    /// Wall-clock time the run took.
    pub elapsed: Duration,
}

/// A source of pass/fail observations for test schedules.
///
/// The call is blocking and thread-safe: concurrent callers are serialized
/// on resource availability, and every call observes an application in its
/// initial state. Idempotence is *not* promised — the underlying suite may
/// be flaky, and detectors bound flakiness with their own retry policy.
pub trait Oracle: Send + Sync + 'static {
    /// Runs a schedule and reports one boolean per test.
    ///
    /// The result vector always has exactly one entry per scheduled test; a
    /// failing test does not short-circuit the run.
    fn run_schedule(
        &self,
        schedule: Vec<String>,
    ) -> impl Future<Output = Result<RunResults, OracleError>> + Send;

    /// The number of currently usable runners behind this oracle.
    fn size(&self) -> usize;
}
