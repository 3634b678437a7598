// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `pradet` strategy: sequential edge inversion with cycle avoidance.
//!
//! Start from the total order "everything depends on everything earlier".
//! For each candidate edge, invert it and run the schedule the inverted
//! graph implies for its target: if everything up to the edge's source still
//! passes, the original edge was spurious and stays removed; otherwise it is
//! restored. Inversions that would close a cycle are skipped.

use crate::{
    detect::run_with_retry,
    errors::OracleError,
    graph::DependencyGraph,
    oracle::Oracle,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

pub(super) async fn detect<O: Oracle>(
    tests: &[String],
    oracle: &Arc<O>,
) -> Result<DependencyGraph, OracleError> {
    let mut graph = DependencyGraph::new(tests.iter().cloned());
    if tests.len() <= 1 {
        return Ok(graph);
    }

    // Candidates ordered by distance, nearest pairs first.
    let mut edges: Vec<(String, String)> = Vec::new();
    for distance in 1..tests.len() {
        for j in distance..tests.len() {
            edges.push((tests[j].clone(), tests[j - distance].clone()));
            graph.add_dependency(&tests[j], &tests[j - distance]);
        }
    }

    debug!("starting dependency detection algorithm");

    let mut cursor = 0;
    while !edges.is_empty() {
        // Every remaining candidate is cycle-blocked: the surviving edges
        // stay in the graph and the reduction cleans up what they imply.
        let Some((index, dependencies)) = select_invertible(&mut graph, &edges, cursor) else {
            break;
        };
        let (from, to) = edges[index].clone();

        let mut schedule: Vec<String> = tests
            .iter()
            .filter(|test| dependencies.contains(*test))
            .cloned()
            .collect();
        schedule.push(to.clone());

        let outcome = run_with_retry(oracle.as_ref(), schedule, 0).await?;
        debug!("run tests {:?} -> {:?}", outcome.schedule, outcome.results);

        graph.remove_dependency(&to, &from);

        for (test, passed) in outcome.schedule.iter().zip(&outcome.results) {
            if *test == from {
                if !passed {
                    graph.add_dependency(&from, &to);
                }
                break;
            } else if !*passed {
                // A failure before the source is reached: keep the edge and
                // let the failing pair be probed by its own candidate.
                graph.add_dependency(&from, &to);
                break;
            }
        }

        edges.remove(index);
        cursor = if edges.is_empty() {
            0
        } else {
            index % edges.len()
        };
    }

    debug!("finished dependency detection algorithm");
    graph.transitive_reduction();

    Ok(graph)
}

/// Starting at `cursor`, finds the first candidate whose inversion does not
/// close a cycle and leaves that inversion applied. Returns the candidate's
/// index and the post-inversion dependency closure of its target.
fn select_invertible(
    graph: &mut DependencyGraph,
    edges: &[(String, String)],
    cursor: usize,
) -> Option<(usize, BTreeSet<String>)> {
    for tried in 0..edges.len() {
        let index = (cursor + tried) % edges.len();
        let (from, to) = &edges[index];

        graph.invert_dependency(from, to);
        let dependencies = graph.dependencies_of(to);
        if dependencies.contains(to) {
            graph.invert_dependency(to, from);
            continue;
        }

        return Some((index, dependencies));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{
        test_helpers::{
            assert_valid_result, check_detects, check_diamond, check_existing_dependencies,
            check_no_dependencies, check_or_dependencies, generated_topology, graph,
            oracle_for_requirements,
        },
        Detector,
    };

    #[tokio::test]
    async fn no_dependencies() {
        check_no_dependencies(Detector::PraDet).await;
    }

    #[tokio::test]
    async fn existing_dependencies() {
        check_existing_dependencies(Detector::PraDet).await;
    }

    #[tokio::test]
    async fn or_dependencies() {
        check_or_dependencies(Detector::PraDet).await;
    }

    #[tokio::test]
    async fn diamond() {
        check_diamond(Detector::PraDet).await;
    }

    /// With a short and a long alternative prefix, pradet may settle on the
    /// tail of either; both are sound.
    #[tokio::test]
    async fn or_dependencies_of_multiple_lengths() {
        check_detects(
            Detector::PraDet,
            &["test1", "test2", "test3", "test4", "test5"],
            &[
                ("test2", &[&["test1"]]),
                ("test3", &[&["test1", "test2"]]),
                ("test5", &[&["test1", "test2", "test3"], &["test4"]]),
            ],
            &[
                graph(
                    &["test1", "test2", "test3", "test4", "test5"],
                    &[
                        ("test2", "test1"),
                        ("test3", "test2"),
                        ("test5", "test4"),
                    ],
                ),
                graph(
                    &["test1", "test2", "test3", "test4", "test5"],
                    &[
                        ("test2", "test1"),
                        ("test3", "test2"),
                        ("test5", "test3"),
                    ],
                ),
            ],
        )
        .await;

        check_detects(
            Detector::PraDet,
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
            &[
                graph(
                    &["test1", "test2", "test3", "test4", "test5", "test6"],
                    &[
                        ("test2", "test1"),
                        ("test3", "test2"),
                        ("test5", "test4"),
                        ("test6", "test5"),
                    ],
                ),
                graph(
                    &["test1", "test2", "test3", "test4", "test5", "test6"],
                    &[
                        ("test2", "test1"),
                        ("test3", "test2"),
                        ("test5", "test3"),
                        ("test6", "test5"),
                    ],
                ),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn generated_topologies_yield_sound_graphs() {
        for seed in [5, 97, 2024] {
            let (tests, requirements, _expected) = generated_topology(7, 0.3, seed);
            let oracle = Arc::new(oracle_for_requirements(5, &requirements));

            let got = Detector::PraDet.detect(&tests, &oracle).await.unwrap();
            assert_valid_result(&tests, &oracle, &got);
        }
    }
}
