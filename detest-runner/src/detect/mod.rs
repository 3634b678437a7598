// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dependency-detection algorithms.
//!
//! All three detectors consume the [`Oracle`] contract and produce a
//! [`DependencyGraph`] that is acyclic and transitively reduced. Graph
//! mutation always happens on the orchestrating task; worker tasks only run
//! schedules and report observations back over channels.

mod memfast;
mod pfast;
mod pradet;

#[cfg(test)]
pub(crate) mod test_helpers;

use crate::{
    errors::{DetectorNotFound, OracleError},
    graph::DependencyGraph,
    helpers::first_failed,
    oracle::Oracle,
};
use std::{fmt, str::FromStr, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};

/// How many times a schedule is re-run when its outcome violates a
/// detector's structural invariant, before the latest observation is
/// accepted as truth.
pub(crate) const FLAKE_RETRIES: u32 = 3;

/// A dependency-detection strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detector {
    /// Parallel one-at-a-time exclusion with a post-hoc recovery pass.
    Pfast,
    /// Sequential edge inversion with cycle avoidance.
    PraDet,
    /// Rank-by-rank prefix growth with a bounded merge search.
    MemFast,
}

impl Detector {
    /// The names accepted by [`Detector::from_str`].
    pub fn variants() -> Vec<&'static str> {
        vec!["pfast", "pradet", "mem-fast"]
    }

    /// Runs the detection strategy over `tests`, obtaining observations
    /// from `oracle`.
    ///
    /// The returned graph has exactly `tests` as its vertex set, is acyclic
    /// and is transitively reduced.
    pub async fn detect<O: Oracle>(
        self,
        tests: &[String],
        oracle: &Arc<O>,
    ) -> Result<DependencyGraph, OracleError> {
        match self {
            Self::Pfast => pfast::detect(tests, oracle).await,
            Self::PraDet => pradet::detect(tests, oracle).await,
            Self::MemFast => memfast::detect(tests, oracle).await,
        }
    }
}

impl FromStr for Detector {
    type Err = DetectorNotFound;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "pfast" => Ok(Self::Pfast),
            "pradet" => Ok(Self::PraDet),
            "mem-fast" => Ok(Self::MemFast),
            _ => Err(DetectorNotFound {
                name: name.to_owned(),
                known: Self::variants(),
            }),
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pfast => "pfast",
            Self::PraDet => "pradet",
            Self::MemFast => "mem-fast",
        };
        write!(f, "{name}")
    }
}

/// One observed schedule execution.
#[derive(Clone, Debug)]
pub(crate) struct ScheduleOutcome {
    pub(crate) schedule: Vec<String>,
    pub(crate) results: Vec<bool>,
}

impl ScheduleOutcome {
    pub(crate) fn first_failed(&self) -> Option<usize> {
        first_failed(&self.results)
    }

    pub(crate) fn passed(&self) -> bool {
        self.first_failed().is_none()
    }
}

/// Runs one schedule, masking flakes: a failure that is not in the terminal
/// position is retried up to `retries` times, after which the latest
/// observation is returned.
pub(crate) async fn run_with_retry<O: Oracle>(
    oracle: &O,
    schedule: Vec<String>,
    retries: u32,
) -> Result<ScheduleOutcome, OracleError> {
    let mut results = oracle.run_schedule(schedule.clone()).await?.results;

    let mut attempts = 0;
    while attempts < retries {
        match first_failed(&results) {
            Some(position) if position + 1 != results.len() => {
                attempts += 1;
                results = oracle.run_schedule(schedule.clone()).await?.results;
            }
            _ => break,
        }
    }

    Ok(ScheduleOutcome { schedule, results })
}

/// Runs a batch of schedules across `oracle.size()` worker tasks draining a
/// shared job queue, and collects every outcome.
///
/// The first oracle error aborts the batch and is returned; remaining
/// workers wind down as their current runs complete.
pub(crate) async fn run_batch<O: Oracle>(
    oracle: &Arc<O>,
    schedules: Vec<Vec<String>>,
    retries: u32,
) -> Result<Vec<ScheduleOutcome>, OracleError> {
    if schedules.is_empty() {
        return Ok(Vec::new());
    }

    let workers = oracle.size().max(1).min(schedules.len());
    let expected = schedules.len();

    let (job_tx, job_rx) = mpsc::unbounded_channel();
    for schedule in schedules {
        let _ = job_tx.send(schedule);
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let oracle = Arc::clone(oracle);
        let job_rx = Arc::clone(&job_rx);
        let outcome_tx = outcome_tx.clone();
        tasks.spawn(async move {
            loop {
                let job = { job_rx.lock().await.recv().await };
                let Some(schedule) = job else { break };

                let report = run_with_retry(oracle.as_ref(), schedule, retries).await;
                let fatal = report.is_err();
                if outcome_tx.send(report).is_err() || fatal {
                    break;
                }
            }
        });
    }
    drop(outcome_tx);

    let mut outcomes = Vec::with_capacity(expected);
    let mut first_error = None;
    while let Some(report) = outcome_rx.recv().await {
        match report {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                // Stop handing out jobs so the workers exit promptly.
                job_rx.lock().await.close();
            }
        }
    }

    while tasks.join_next().await.is_some() {}

    match first_error {
        Some(err) => Err(err),
        None => Ok(outcomes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::test_helpers::MockOracle;

    #[test]
    fn detector_names_round_trip() {
        for name in Detector::variants() {
            let detector: Detector = name.parse().unwrap();
            assert_eq!(detector.to_string(), name);
        }
    }

    #[test]
    fn unknown_detectors_are_rejected() {
        let err = "exlinear".parse::<Detector>().unwrap_err();
        assert_eq!(err.name(), "exlinear");
        assert!(err.to_string().contains("pfast, pradet, mem-fast"));
    }

    #[tokio::test]
    async fn run_batch_collects_every_outcome() {
        let oracle = Arc::new(MockOracle::passing(4));
        let schedules: Vec<Vec<String>> = (0..10)
            .map(|k| vec![format!("t{k}"), format!("u{k}")])
            .collect();

        let outcomes = run_batch(&oracle, schedules.clone(), 0).await.unwrap();
        assert_eq!(outcomes.len(), schedules.len());
        for outcome in outcomes {
            assert!(outcome.passed());
            assert_eq!(outcome.results.len(), 2);
        }
    }

    #[tokio::test]
    async fn run_with_retry_keeps_terminal_failures() {
        // t2 can never pass without t1, and the failure is terminal: no
        // retries should be spent on it.
        let oracle = MockOracle::with_dependencies(2, &[("t2", &[&["t1"]])]);
        let outcome = run_with_retry(&oracle, vec!["t2".to_owned()], FLAKE_RETRIES)
            .await
            .unwrap();
        assert_eq!(outcome.results, vec![false]);
        assert_eq!(oracle.calls(), 1);

        // A non-terminal failure is retried until the budget runs out.
        let outcome = run_with_retry(
            &oracle,
            vec!["t2".to_owned(), "x".to_owned()],
            FLAKE_RETRIES,
        )
        .await
        .unwrap();
        assert_eq!(outcome.results, vec![false, false]);
        assert_eq!(oracle.calls(), 1 + 1 + FLAKE_RETRIES as usize);
    }
}
