// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `mem-fast` strategy: rank-by-rank prefix growth with a bounded merge
//! search for hard tests.
//!
//! The algorithm grows a table of passing schedules organized by length:
//! row `k` holds distinct passing schedules of length `k + 1`. Tests that
//! have not passed in any schedule yet form the failed set. Each rank, every
//! failed test is appended to every suitable row entry of the previous rank;
//! a pass resolves the test with its immediate predecessor as dependency.
//! When the rank's own test stays failed, an extensive search merges pairs
//! of known schedules into longer candidate prefixes. A fingerprint set over
//! dispatched schedules keeps the search from rerunning anything.

use crate::{
    detect::{run_batch, ScheduleOutcome, FLAKE_RETRIES},
    errors::OracleError,
    graph::DependencyGraph,
    oracle::Oracle,
};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Passing schedules by length: `rows[k]` holds schedules of length `k + 1`.
#[derive(Default)]
struct Table {
    rows: Vec<Vec<Vec<String>>>,
}

impl Table {
    fn ensure_row(&mut self, rank: usize) {
        while self.rows.len() <= rank {
            self.rows.push(Vec::new());
        }
    }

    fn row(&self, rank: usize) -> &[Vec<String>] {
        self.rows.get(rank).map_or(&[], Vec::as_slice)
    }

    fn insert_unique(&mut self, schedule: Vec<String>) {
        let rank = schedule.len() - 1;
        self.ensure_row(rank);
        if !self.rows[rank].contains(&schedule) {
            self.rows[rank].push(schedule);
        }
    }
}

/// How a passing schedule's dependencies are recorded for its final test.
#[derive(Clone, Copy)]
enum EdgePolicy {
    /// Only the immediate predecessor (rank growth: the rest of the prefix
    /// is already explained by the table).
    Immediate,
    /// Every test of the prefix (extensive search: the prefix was found as
    /// a whole and the final reduction prunes what is implied).
    WholePrefix,
}

pub(super) async fn detect<O: Oracle>(
    tests: &[String],
    oracle: &Arc<O>,
) -> Result<DependencyGraph, OracleError> {
    let mut graph = DependencyGraph::new(tests.iter().cloned());
    let rev: HashMap<&str, usize> = tests
        .iter()
        .enumerate()
        .map(|(index, test)| (test.as_str(), index))
        .collect();

    let mut table = Table::default();
    let mut failed: HashSet<String> = HashSet::new();
    let mut dispatched: HashSet<String> = HashSet::new();

    info!("starting dependency detection algorithm");

    // Phase A: every test alone. Passing singletons seed the table.
    let singles: Vec<Vec<String>> = tests
        .iter()
        .map(|test| vec![test.clone()])
        .filter(|schedule| dispatched.insert(fingerprint(schedule)))
        .collect();
    for outcome in run_batch(oracle, singles, FLAKE_RETRIES).await? {
        if outcome.passed() {
            table.insert_unique(outcome.schedule);
        } else {
            failed.insert(outcome.schedule[0].clone());
        }
    }
    debug!("tests with no passing schedule yet: {failed:?}");

    for rank in 1..tests.len() {
        if failed.is_empty() {
            break;
        }
        table.ensure_row(rank);

        // Phase B: append every failed test to every prefix of the previous
        // rank that ends before it in suite order.
        let mut jobs = Vec::new();
        let still_failed = ordered(tests, &failed);
        for test in &still_failed {
            for prefix in table.row(rank - 1) {
                if !precedes(prefix, test, &rev) {
                    continue;
                }
                let mut candidate = prefix.clone();
                candidate.push(test.clone());
                if dispatched.insert(fingerprint(&candidate)) {
                    jobs.push(candidate);
                }
            }
        }

        let outcomes = run_batch(oracle, jobs, FLAKE_RETRIES).await?;
        absorb(
            outcomes,
            &mut table,
            &mut graph,
            &mut failed,
            EdgePolicy::Immediate,
        );

        if failed.is_empty() {
            break;
        }
        let focus = tests[rank].clone();
        if !failed.contains(&focus) {
            debug!("finished rank {rank}, {} tests still failing", failed.len());
            continue;
        }

        // Phase C: merge pairs of known schedules into candidate prefixes
        // of growing length until the rank's own test resolves.
        info!("starting extensive search for {focus}");
        for prefix_len in 2..=rank {
            let mut jobs = Vec::new();
            let still_failed = ordered(tests, &failed);

            for base in 1..prefix_len {
                for s1 in table.row(base - 1) {
                    for upper in (prefix_len - base - 1)..table.rows.len() {
                        for s2 in table.row(upper) {
                            let merged = merge(s1, s2, &rev);
                            if merged.len() != prefix_len {
                                continue;
                            }
                            for test in &still_failed {
                                if !precedes(&merged, test, &rev) {
                                    continue;
                                }
                                let mut candidate = merged.clone();
                                candidate.push(test.clone());
                                if dispatched.insert(fingerprint(&candidate)) {
                                    jobs.push(candidate);
                                }
                            }
                        }
                    }
                }
            }

            let outcomes = run_batch(oracle, jobs, FLAKE_RETRIES).await?;
            absorb(
                outcomes,
                &mut table,
                &mut graph,
                &mut failed,
                EdgePolicy::WholePrefix,
            );

            // Fan the whole table out against the remaining failed tests;
            // this often resolves them without returning to the outer loop.
            let mut fanout = Vec::new();
            let still_failed = ordered(tests, &failed);
            for row in 0..rank {
                for prefix in table.row(row) {
                    for test in &still_failed {
                        if !precedes(prefix, test, &rev) {
                            continue;
                        }
                        let mut candidate = prefix.clone();
                        candidate.push(test.clone());
                        if dispatched.insert(fingerprint(&candidate)) {
                            fanout.push(candidate);
                        }
                    }
                }
            }

            let outcomes = run_batch(oracle, fanout, FLAKE_RETRIES).await?;
            absorb(
                outcomes,
                &mut table,
                &mut graph,
                &mut failed,
                EdgePolicy::WholePrefix,
            );

            if !failed.contains(&focus) {
                break;
            }
        }

        if failed.contains(&focus) {
            warn!("could not find a passing schedule for test {focus}");
        }
        debug!("finished rank {rank}, {} tests still failing", failed.len());
    }

    for test in ordered(tests, &failed) {
        warn!("test {test} remains unresolved");
    }
    info!("finished dependency detection algorithm");

    graph.transitive_reduction();
    Ok(graph)
}

/// Folds a batch of outcomes into the table, the failed set, and the graph.
///
/// Shorter schedules are absorbed first so a test resolved by a minimal
/// prefix is not attributed a longer one that happened to finish earlier.
/// Any schedule whose only failure is its final test still contributes its
/// prefix to the table: that prefix provably passed.
fn absorb(
    mut outcomes: Vec<ScheduleOutcome>,
    table: &mut Table,
    graph: &mut DependencyGraph,
    failed: &mut HashSet<String>,
    policy: EdgePolicy,
) {
    outcomes.sort_by_key(|outcome| outcome.schedule.len());

    for outcome in outcomes {
        debug!("run tests {:?} -> {:?}", outcome.schedule, outcome.results);
        match outcome.first_failed() {
            None => {
                let (appended, prefix) = outcome
                    .schedule
                    .split_last()
                    .expect("dispatched schedules are never empty");
                if !prefix.is_empty() {
                    table.insert_unique(prefix.to_vec());
                }
                table.insert_unique(outcome.schedule.clone());

                if failed.remove(appended) {
                    debug!("done with test {appended}");
                    match policy {
                        EdgePolicy::Immediate => {
                            if let Some(previous) = prefix.last() {
                                graph.add_dependency(appended, previous);
                            }
                        }
                        EdgePolicy::WholePrefix => {
                            for dependency in prefix {
                                graph.add_dependency(appended, dependency);
                            }
                        }
                    }
                }
            }
            Some(position) if position + 1 == outcome.schedule.len() => {
                let prefix = &outcome.schedule[..position];
                if !prefix.is_empty() {
                    table.insert_unique(prefix.to_vec());
                }
            }
            Some(_) => {}
        }
    }
}

/// The failed set in suite order.
fn ordered(tests: &[String], failed: &HashSet<String>) -> Vec<String> {
    tests
        .iter()
        .filter(|test| failed.contains(*test))
        .cloned()
        .collect()
}

/// True if the last element of `schedule` comes before `test` in suite
/// order.
fn precedes(schedule: &[String], test: &str, rev: &HashMap<&str, usize>) -> bool {
    match schedule.last() {
        Some(last) => rev[last.as_str()] < rev[test],
        None => false,
    }
}

/// The order-preserving merge of two schedules, taking a single copy of
/// shared elements.
fn merge(s1: &[String], s2: &[String], rev: &HashMap<&str, usize>) -> Vec<String> {
    let mut merged = Vec::with_capacity(s1.len() + s2.len());
    let (mut i, mut j) = (0, 0);

    while i < s1.len() && j < s2.len() {
        match rev[s1[i].as_str()].cmp(&rev[s2[j].as_str()]) {
            Ordering::Less => {
                merged.push(s1[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                merged.push(s2[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                merged.push(s1[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend_from_slice(&s1[i..]);
    merged.extend_from_slice(&s2[j..]);

    merged
}

fn fingerprint(schedule: &[String]) -> String {
    schedule.join("\u{1f}")
}
