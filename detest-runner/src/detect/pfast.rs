// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `pfast` strategy: parallel one-at-a-time exclusion with a post-hoc
//! recovery pass.
//!
//! For each position `i`, remove the test at `i` and run the remaining
//! schedule. If some later test now fails, that test depended on something
//! that was removed: record an edge from the first failing test to the
//! excluded one, exclude the failing test as well, and try again. The
//! exclusion jobs are drained by a pool of workers so up to `size + 1`
//! schedules are in flight at once.
//!
//! The exclusion phase over-prunes in the presence of disjunctive
//! dependencies, so a recovery pass re-runs the schedules implied by the
//! graph and repairs the prefixes of tests that still fail.

use crate::{
    detect::{run_batch, run_with_retry, FLAKE_RETRIES},
    errors::OracleError,
    graph::DependencyGraph,
    helpers::{first_failed, remove_index},
    oracle::Oracle,
};
use indexmap::IndexMap;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{debug, info};

/// One exclusion job: run `schedule` minus the element at `to_remove`,
/// attributing any new failure to the original test at index `excluded`.
struct Job {
    schedule: Vec<String>,
    to_remove: usize,
    excluded: usize,
    attempts: u32,
}

/// What a worker observed for one job.
struct Report {
    job: Job,
    /// The schedule that actually ran (`job.schedule` minus the removed
    /// element).
    schedule: Vec<String>,
    first_failed: Option<usize>,
}

pub(super) async fn detect<O: Oracle>(
    tests: &[String],
    oracle: &Arc<O>,
) -> Result<DependencyGraph, OracleError> {
    let mut graph = DependencyGraph::new(tests.iter().cloned());

    debug!("starting dependency detection algorithm");
    if tests.len() > 1 {
        exclusion_phase(tests, oracle, &mut graph).await?;
        graph.transitive_reduction();

        info!("starting recovery");
        recovery(tests, oracle, &mut graph).await?;
    }
    debug!("finished dependency detection algorithm");

    graph.transitive_reduction();
    Ok(graph)
}

async fn exclusion_phase<O: Oracle>(
    tests: &[String],
    oracle: &Arc<O>,
    graph: &mut DependencyGraph,
) -> Result<(), OracleError> {
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    for _ in 0..oracle.size() + 1 {
        workers.spawn(worker(
            Arc::clone(oracle),
            Arc::clone(&job_rx),
            report_tx.clone(),
        ));
    }
    drop(report_tx);

    // One exclusion chain per test position except the last; a chain is done
    // once a run comes back clean or shrinks to a single test.
    let mut pending = tests.len() - 1;
    for i in 0..tests.len() - 1 {
        let _ = job_tx.send(Job {
            schedule: tests.to_vec(),
            to_remove: i,
            excluded: i,
            attempts: 0,
        });
    }

    let mut first_error = None;
    while pending > 0 {
        let Some(report) = report_rx.recv().await else {
            break;
        };
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                first_error = Some(err);
                break;
            }
        };

        match report.first_failed {
            None => pending -= 1,
            Some(failed)
                if failed < report.job.excluded && report.job.attempts < FLAKE_RETRIES =>
            {
                // A failure before the excluded position contradicts the
                // exclusion invariant; treat it as a flake and rerun the
                // same job. Past the retry budget the observation stands.
                let _ = job_tx.send(Job {
                    attempts: report.job.attempts + 1,
                    ..report.job
                });
            }
            Some(failed) => {
                graph.add_dependency(&report.schedule[failed], &tests[report.job.excluded]);

                if report.schedule.len() > 1 {
                    let _ = job_tx.send(Job {
                        schedule: report.schedule,
                        to_remove: failed,
                        excluded: report.job.excluded,
                        attempts: 0,
                    });
                } else {
                    pending -= 1;
                }
            }
        }
    }

    drop(job_tx);
    if first_error.is_some() {
        job_rx.lock().await.close();
    }
    while report_rx.recv().await.is_some() {}
    while workers.join_next().await.is_some() {}

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn worker<O: Oracle>(
    oracle: Arc<O>,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    reports: mpsc::UnboundedSender<Result<Report, OracleError>>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };

        let schedule = remove_index(&job.schedule, job.to_remove);
        match oracle.run_schedule(schedule.clone()).await {
            Ok(run) => {
                debug!("run tests {schedule:?} -> {:?}", run.results);
                let report = Report {
                    first_failed: first_failed(&run.results),
                    job,
                    schedule,
                };
                if reports.send(Ok(report)).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = reports.send(Err(err));
                break;
            }
        }
    }
}

/// Re-runs the schedules the graph implies and repairs the prefix of every
/// test that still fails, spending at most one run per candidate ancestor.
async fn recovery<O: Oracle>(
    tests: &[String],
    oracle: &Arc<O>,
    graph: &mut DependencyGraph,
) -> Result<(), OracleError> {
    let schedules = graph.schedules(tests);
    let not_passing = detect_failing_tests(oracle, &schedules).await?;
    if not_passing.is_empty() {
        return Ok(());
    }
    info!(
        "tests failing under the inferred graph: {:?}",
        not_passing.keys().collect::<Vec<_>>()
    );

    let mut passed: HashSet<usize> = HashSet::new();

    for (position, test) in tests.iter().enumerate() {
        if solved(&not_passing, &passed, test) {
            continue;
        }
        info!("recovery working on test {test}");

        adjust_edges(tests, position, test, oracle, graph).await?;

        let dependencies = graph.dependencies_of(test);
        let prefix: Vec<String> = tests
            .iter()
            .filter(|t| dependencies.contains(*t))
            .cloned()
            .collect();

        // Re-verify the schedules this test was failing in, replacing the
        // part before the test with the repaired prefix.
        let Some(failing) = not_passing.get(test) else {
            continue;
        };
        for &index in failing {
            if passed.contains(&index) {
                continue;
            }

            let offset = schedules[index]
                .iter()
                .position(|t| t == test)
                .unwrap_or_else(|| panic!("test {test} is part of its failing schedule"));
            let mut schedule = prefix.clone();
            for t in &schedules[index][offset..] {
                if !schedule.contains(t) {
                    schedule.push(t.clone());
                }
            }

            let outcome = run_with_retry(oracle.as_ref(), schedule, 0).await?;
            debug!("run tests {:?} -> {:?}", outcome.schedule, outcome.results);
            if outcome.passed() {
                passed.insert(index);
            }
        }
    }

    Ok(())
}

/// Runs every schedule once and maps each failing test to the schedules it
/// failed in.
async fn detect_failing_tests<O: Oracle>(
    oracle: &Arc<O>,
    schedules: &[Vec<String>],
) -> Result<HashMap<String, BTreeSet<usize>>, OracleError> {
    let index_of: HashMap<&Vec<String>, usize> = schedules
        .iter()
        .enumerate()
        .map(|(index, schedule)| (schedule, index))
        .collect();

    let outcomes = run_batch(oracle, schedules.to_vec(), 0).await?;

    let mut not_passing: HashMap<String, BTreeSet<usize>> = HashMap::new();
    for outcome in &outcomes {
        let index = index_of[&outcome.schedule];
        for (test, passed) in outcome.schedule.iter().zip(&outcome.results) {
            if !passed {
                not_passing.entry(test.clone()).or_default().insert(index);
            }
        }
    }

    Ok(not_passing)
}

fn solved(
    not_passing: &HashMap<String, BTreeSet<usize>>,
    passed: &HashSet<usize>,
    test: &str,
) -> bool {
    match not_passing.get(test) {
        None => true,
        Some(failing) => failing.iter().all(|index| passed.contains(index)),
    }
}

/// Greedily re-adds the candidate ancestors of `test` as dependencies, then
/// probes each candidate's removal with one run: if the test still passes
/// without it the candidate is dropped, if removing it makes the test fail
/// the candidate is kept.
async fn adjust_edges<O: Oracle>(
    tests: &[String],
    position: usize,
    test: &str,
    oracle: &Arc<O>,
    graph: &mut DependencyGraph,
) -> Result<(), OracleError> {
    let mut candidates = possible_targets(&tests[..position], graph);
    let targets: Vec<String> = candidates.keys().cloned().collect();
    for target in &targets {
        debug!("recovery adds candidate edge {test} -> {target}");
        graph.add_dependency(test, target);
    }

    while let Some(target) = select_target(&candidates) {
        debug!("probing recovery candidate {target}");
        graph.remove_dependency(test, &target);

        let dependencies = graph.dependencies_of(test);
        let mut schedule: Vec<String> = tests
            .iter()
            .filter(|t| dependencies.contains(*t))
            .cloned()
            .collect();
        schedule.push(test.to_owned());

        let outcome = run_with_retry(oracle.as_ref(), schedule, 0).await?;
        debug!("run tests {:?} -> {:?}", outcome.schedule, outcome.results);

        if !outcome.passed() {
            graph.add_dependency(test, &target);
        }
        candidates.shift_remove(&target);
    }

    Ok(())
}

/// The roots of the schedule cover over `tests`: every test not already in
/// some later test's closure, weighted by its closure size.
fn possible_targets(tests: &[String], graph: &DependencyGraph) -> IndexMap<String, usize> {
    let mut targets = IndexMap::new();
    let mut visited: HashSet<String> = HashSet::new();

    for test in tests.iter().rev() {
        if visited.contains(test) {
            continue;
        }

        let dependencies = graph.dependencies_of(test);
        targets.insert(test.clone(), dependencies.len());
        visited.insert(test.clone());
        visited.extend(dependencies);
    }

    targets
}

/// Picks the candidate with the largest closure; earlier candidates win
/// ties.
fn select_target(candidates: &IndexMap<String, usize>) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for (target, weight) in candidates {
        if best.is_none_or(|(_, max)| *weight > max) {
            best = Some((target, *weight));
        }
    }
    best.map(|(target, _)| target.clone())
}
