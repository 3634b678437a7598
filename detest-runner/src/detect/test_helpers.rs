// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scripted oracle for detector tests.

use crate::{
    detect::Detector,
    errors::OracleError,
    graph::DependencyGraph,
    oracle::{Oracle, RunResults},
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// An oracle that simulates a suite with known dependencies.
///
/// Each test maps to a disjunction of prerequisite lists; the test passes
/// when at least one list is a subsequence of the tests that ran before it.
/// The first failing test ends the simulated run, leaving later entries
/// `false` — just like a real suite whose remaining tests crash on the
/// broken state.
pub(crate) struct MockOracle {
    dependencies: HashMap<String, Vec<Vec<String>>>,
    size: usize,
    calls: AtomicUsize,
}

impl MockOracle {
    /// An oracle where every test always passes.
    pub(crate) fn passing(size: usize) -> Self {
        Self::with_dependencies(size, &[])
    }

    /// An oracle with the given dependency disjunctions.
    pub(crate) fn with_dependencies(size: usize, entries: &[(&str, &[&[&str]])]) -> Self {
        let dependencies = entries
            .iter()
            .map(|(test, alternatives)| {
                (
                    test.to_string(),
                    alternatives
                        .iter()
                        .map(|alt| alt.iter().map(|t| t.to_string()).collect())
                        .collect(),
                )
            })
            .collect();

        Self::from_map(size, dependencies)
    }

    /// An oracle built from an owned dependency map.
    pub(crate) fn from_map(
        size: usize,
        dependencies: HashMap<String, Vec<Vec<String>>>,
    ) -> Self {
        Self {
            dependencies,
            size,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many schedules have been dispatched so far.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    fn simulate(&self, schedule: &[String]) -> Vec<bool> {
        let mut results = vec![false; schedule.len()];

        for i in 0..schedule.len() {
            let passed = match self.dependencies.get(&schedule[i]) {
                None => true,
                Some(alternatives) => alternatives
                    .iter()
                    .any(|prerequisites| is_subsequence(prerequisites, &schedule[..i])),
            };

            results[i] = passed;
            if !passed {
                break;
            }
        }

        results
    }
}

fn is_subsequence(needle: &[String], haystack: &[String]) -> bool {
    let mut j = 0;
    for item in haystack {
        if j < needle.len() && needle[j] == *item {
            j += 1;
        }
    }
    j == needle.len()
}

impl Oracle for MockOracle {
    fn run_schedule(
        &self,
        schedule: Vec<String>,
    ) -> impl Future<Output = Result<RunResults, OracleError>> + Send {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let results = self.simulate(&schedule);
        std::future::ready(Ok(RunResults {
            results,
            elapsed: Duration::ZERO,
        }))
    }

    fn size(&self) -> usize {
        self.size
    }
}

pub(crate) fn suite(tests: &[&str]) -> Vec<String> {
    tests.iter().map(|t| t.to_string()).collect()
}

pub(crate) fn graph(tests: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
    let mut graph = DependencyGraph::new(tests.iter().copied());
    for (from, to) in edges {
        graph.add_dependency(from, to);
    }
    graph
}

/// Runs a detector over a simulated suite and asserts the result is one of
/// the accepted graphs.
pub(crate) async fn check_detects(
    detector: Detector,
    tests: &[&str],
    dependencies: &[(&str, &[&[&str]])],
    accepted: &[DependencyGraph],
) {
    let oracle = Arc::new(MockOracle::with_dependencies(5, dependencies));
    let got = detector.detect(&suite(tests), &oracle).await.unwrap();

    assert!(
        accepted.iter().any(|expected| *expected == got),
        "{detector}: expected one of {accepted:#?}, but got {got:#?}"
    );
}

/// The scenarios every detector must solve exactly.
pub(crate) async fn check_no_dependencies(detector: Detector) {
    for tests in [&["test1", "test2", "test3"][..], &["test1"][..], &[][..]] {
        check_detects(detector, tests, &[], &[graph(tests, &[])]).await;
    }
}

pub(crate) async fn check_existing_dependencies(detector: Detector) {
    check_detects(
        detector,
        &["test1", "test2", "test3"],
        &[
            ("test2", &[&["test1"]]),
            ("test3", &[&["test1", "test2"]]),
        ],
        &[graph(
            &["test1", "test2", "test3"],
            &[("test2", "test1"), ("test3", "test2")],
        )],
    )
    .await;

    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[
            ("test3", &[&["test1", "test2"]]),
            ("test5", &[&["test1", "test2", "test3"]]),
        ],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test3", "test1"),
                ("test3", "test2"),
                ("test5", "test3"),
            ],
        )],
    )
    .await;

    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[("test5", &[&["test1", "test2", "test3", "test4"]])],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test5", "test1"),
                ("test5", "test2"),
                ("test5", "test3"),
                ("test5", "test4"),
            ],
        )],
    )
    .await;
}

pub(crate) async fn check_or_dependencies(detector: Detector) {
    // Either prerequisite alone satisfies test3; exactly one must be kept.
    check_detects(
        detector,
        &["test1", "test2", "test3"],
        &[("test3", &[&["test1"], &["test2"]])],
        &[
            graph(&["test1", "test2", "test3"], &[("test3", "test1")]),
            graph(&["test1", "test2", "test3"], &[("test3", "test2")]),
        ],
    )
    .await;

    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[
            ("test3", &[&["test2"]]),
            ("test4", &[&["test2", "test3"]]),
            ("test5", &[&["test2", "test3", "test4"], &["test1"]]),
        ],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test3", "test2"),
                ("test4", "test3"),
                ("test5", "test1"),
            ],
        )],
    )
    .await;

    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[("test5", &[&["test2", "test4"], &["test1", "test3"]])],
        &[
            graph(
                &["test1", "test2", "test3", "test4", "test5"],
                &[("test5", "test1"), ("test5", "test3")],
            ),
            graph(
                &["test1", "test2", "test3", "test4", "test5"],
                &[("test5", "test2"), ("test5", "test4")],
            ),
        ],
    )
    .await;
}

/// A diamond: two independent roots, a join, and one free test.
pub(crate) async fn check_diamond(detector: Detector) {
    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[
            ("test3", &[&["test1", "test2"]]),
            ("test5", &[&["test3"]]),
        ],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test3", "test1"),
                ("test3", "test2"),
                ("test5", "test3"),
            ],
        )],
    )
    .await;
}

/// A long chain and a length-1 alternative; the short prefix must win.
pub(crate) async fn check_min_len_or_dependencies(detector: Detector) {
    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5"],
        &[
            ("test2", &[&["test1"]]),
            ("test3", &[&["test1", "test2"]]),
            ("test5", &[&["test1", "test2", "test3"], &["test4"]]),
        ],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test2", "test1"),
                ("test3", "test2"),
                ("test5", "test4"),
            ],
        )],
    )
    .await;

    check_detects(
        detector,
        &["test1", "test2", "test3", "test4", "test5", "test6"],
        &[
            ("test2", &[&["test1"]]),
            ("test3", &[&["test1", "test2"]]),
            ("test5", &[&["test1", "test2", "test3"], &["test4"]]),
            (
                "test6",
                &[&["test1", "test2", "test3", "test5"], &["test4", "test5"]],
            ),
        ],
        &[graph(
            &["test1", "test2", "test3", "test4", "test5", "test6"],
            &[
                ("test2", "test1"),
                ("test3", "test2"),
                ("test5", "test4"),
                ("test6", "test5"),
            ],
        )],
    )
    .await;
}

/// Generates a random DAG over `n` tests with edge probability `p`; each
/// test's requirement is its full transitive closure.
pub(crate) fn generated_topology(
    n: usize,
    p: f64,
    seed: u64,
) -> (Vec<String>, Vec<(String, Vec<String>)>, DependencyGraph) {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let tests: Vec<String> = (1..=n).map(|k| format!("test{k}")).collect();
    let mut generated = DependencyGraph::new(tests.clone());

    for j in 0..n {
        for i in 0..j {
            if rng.gen_bool(p) {
                generated.add_dependency(&tests[j], &tests[i]);
            }
        }
    }

    let requirements: Vec<(String, Vec<String>)> = tests
        .iter()
        .filter_map(|test| {
            let closure = generated.dependencies_of(test);
            if closure.is_empty() {
                return None;
            }
            let ordered: Vec<String> = tests
                .iter()
                .filter(|t| closure.contains(*t))
                .cloned()
                .collect();
            Some((test.clone(), ordered))
        })
        .collect();

    let mut reduced = generated.clone();
    reduced.transitive_reduction();
    (tests, requirements, reduced)
}

/// Builds a [`MockOracle`] where each test has a single prerequisite list.
pub(crate) fn oracle_for_requirements(
    size: usize,
    requirements: &[(String, Vec<String>)],
) -> MockOracle {
    let dependencies = requirements
        .iter()
        .map(|(test, prerequisites)| (test.clone(), vec![prerequisites.clone()]))
        .collect();
    MockOracle::from_map(size, dependencies)
}

/// Asserts the structural invariants every detector guarantees, and that
/// the graph actually explains the suite: every schedule derived from it
/// passes under the oracle's own semantics.
pub(crate) fn assert_valid_result(
    tests: &[String],
    oracle: &MockOracle,
    got: &DependencyGraph,
) {
    let vertices: Vec<&str> = got.tests().collect();
    let expected: Vec<&str> = tests.iter().map(String::as_str).collect();
    assert_eq!(vertices, expected, "vertex set drifted");

    for test in got.tests() {
        assert!(
            !got.dependencies_of(test).contains(test),
            "cycle through {test}"
        );
    }

    let mut reduced = got.clone();
    reduced.transitive_reduction();
    assert_eq!(&reduced, got, "graph is not transitively reduced");

    for schedule in got.schedules(tests) {
        let results = oracle.simulate(&schedule);
        assert!(
            results.iter().all(|passed| *passed),
            "derived schedule {schedule:?} fails: {results:?}"
        );
    }
}
