// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dependency graph over the tests of a suite.
//!
//! Each vertex is a test and each edge records a dependency relationship:
//! the edge `a → b` means "`a` depends on `b`", so `b` must run before `a`
//! for `a` to pass. The vertex set is fixed at construction time and kept in
//! the original suite order, which is what schedule computation is defined
//! against.

use crate::errors::GraphParseError;
use indexmap::IndexMap;
use std::{
    collections::{BTreeSet, HashSet},
    io,
};

/// The graph encoding the dependencies between the tests of a test suite.
///
/// Out-edges point at prerequisites: `dependencies_of` returns everything a
/// test transitively requires. Vertices never change after construction;
/// edges are mutated by the detection algorithms.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    adjacency: IndexMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates a graph without any edges from a list of tests.
    pub fn new<I, S>(tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let adjacency = tests
            .into_iter()
            .map(|test| (test.into(), BTreeSet::new()))
            .collect();
        Self { adjacency }
    }

    /// Reads a graph from its JSON representation: an object mapping each
    /// test to the array of tests it directly depends on.
    ///
    /// Edges referring to tests that are not themselves keys of the object
    /// are rejected.
    pub fn from_json(reader: impl io::Read) -> Result<Self, GraphParseError> {
        let raw: IndexMap<String, Vec<String>> =
            serde_json::from_reader(reader).map_err(GraphParseError::Json)?;

        let mut graph = Self::new(raw.keys().cloned());
        for (test, dependencies) in &raw {
            for dependency in dependencies {
                if !graph.adjacency.contains_key(dependency) {
                    return Err(GraphParseError::UnknownTest {
                        from: test.clone(),
                        to: dependency.clone(),
                    });
                }
                graph.add_dependency(test, dependency);
            }
        }

        Ok(graph)
    }

    /// The number of tests in the graph.
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Returns true if the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// The tests of the graph, in insertion order.
    pub fn tests(&self) -> impl Iterator<Item = &str> {
        self.adjacency.keys().map(String::as_str)
    }

    /// The direct dependencies of a test, if the test is in the graph.
    pub fn direct_dependencies(&self, test: &str) -> Option<&BTreeSet<String>> {
        self.adjacency.get(test)
    }

    fn edges_mut(&mut self, test: &str) -> &mut BTreeSet<String> {
        match self.adjacency.get_mut(test) {
            Some(edges) => edges,
            None => panic!("test '{test}' is not a vertex of the graph"),
        }
    }

    /// Adds a dependency relationship between two tests. Adding an edge that
    /// is already present is a no-op.
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        assert!(
            self.adjacency.contains_key(to),
            "test '{to}' is not a vertex of the graph"
        );
        self.edges_mut(from).insert(to.to_owned());
    }

    /// Removes a dependency relationship between two tests. Removing an edge
    /// that is not present is a no-op.
    pub fn remove_dependency(&mut self, from: &str, to: &str) {
        self.edges_mut(from).remove(to);
    }

    /// Inverts a dependency relationship between two tests.
    pub fn invert_dependency(&mut self, from: &str, to: &str) {
        self.remove_dependency(from, to);
        self.add_dependency(to, from);
    }

    /// Returns every test reachable from `test`, i.e. its transitive
    /// prerequisite set.
    ///
    /// If `test` is reachable from itself the result includes `test`: this
    /// is how callers probe for cycles before committing an edge inversion.
    pub fn dependencies_of(&self, test: &str) -> BTreeSet<String> {
        let mut dependencies = BTreeSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![test];

        while let Some(v) = stack.pop() {
            if let Some(targets) = self.adjacency.get(v) {
                for u in targets {
                    if !visited.contains(u.as_str()) {
                        dependencies.insert(u.clone());
                        stack.push(u);
                    } else if u == test {
                        dependencies.insert(u.clone());
                    }
                }
            }
            visited.insert(v);
        }

        dependencies
    }

    /// Rewrites the graph into its transitive reduction: an edge `v → u` is
    /// dropped whenever `u` is reachable from `v` through some other path.
    ///
    /// The operation is idempotent.
    pub fn transitive_reduction(&mut self) {
        let nodes: Vec<String> = self.adjacency.keys().cloned().collect();

        for node in &nodes {
            let edges = self.adjacency[node].clone();
            let mut min_edges = edges.clone();

            for v in &edges {
                let dependencies = self.dependencies_of(v);
                for u in &edges {
                    if dependencies.contains(u) {
                        min_edges.remove(u);
                    }
                }
            }

            self.adjacency.insert(node.clone(), min_edges);
        }
    }

    /// Computes the schedules needed to cover all the provided tests under
    /// the dependencies in the graph.
    ///
    /// Tests are scanned from last to first; each not-yet-covered test
    /// contributes one schedule made of its transitive prerequisites in the
    /// original order, followed by the test itself.
    pub fn schedules(&self, tests: &[String]) -> Vec<Vec<String>> {
        let mut schedules = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();

        for i in (0..tests.len()).rev() {
            if visited.contains(tests[i].as_str()) {
                continue;
            }

            let dependencies = self.dependencies_of(&tests[i]);
            let mut schedule = Vec::with_capacity(dependencies.len() + 1);

            for item in tests {
                if dependencies.contains(item) {
                    visited.insert(item);
                    schedule.push(item.clone());
                }
            }
            schedule.push(tests[i].clone());
            schedules.push(schedule);
        }

        schedules
    }

    /// Writes the JSON representation of the graph: an object keyed by test,
    /// with the array of direct dependencies as values.
    ///
    /// The output round-trips through [`DependencyGraph::from_json`]; no
    /// transitive reduction is applied here.
    pub fn write_json(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        let raw: IndexMap<&str, Vec<&str>> = self
            .adjacency
            .iter()
            .map(|(test, dependencies)| {
                (
                    test.as_str(),
                    dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        serde_json::to_writer_pretty(&mut *writer, &raw)?;
        writeln!(writer)
    }

    /// Writes the DOT representation of the graph, suitable for Graphviz.
    /// Nodes and edges are listed in sorted order.
    pub fn write_dot(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        writeln!(writer, "digraph {{")?;
        writeln!(writer, "    compound = \"true\"")?;
        writeln!(writer, "    newrank = \"true\"")?;
        writeln!(writer, "    subgraph \"root\" {{")?;

        let mut tests: Vec<&str> = self.adjacency.keys().map(String::as_str).collect();
        tests.sort_unstable();

        for test in &tests {
            writeln!(writer, "        \"{test}\"")?;
        }

        for test in &tests {
            for dependency in &self.adjacency[*test] {
                writeln!(writer, "        \"{test}\" -> \"{dependency}\"")?;
            }
        }

        writeln!(writer, "    }}")?;
        writeln!(writer, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn graph_with_edges(tests: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new(tests.iter().copied());
        for (from, to) in edges {
            graph.add_dependency(from, to);
        }
        graph
    }

    #[test]
    fn new_graph_has_no_edges() {
        for tests in [&["node1", "node2", "node3"][..], &["node1"][..], &[][..]] {
            let graph = DependencyGraph::new(tests.iter().copied());

            assert_eq!(graph.len(), tests.len());
            for test in tests {
                assert_eq!(
                    graph.direct_dependencies(test),
                    Some(&BTreeSet::new()),
                    "expected no edges out of {test}"
                );
            }
        }
    }

    #[test]
    fn add_dependency_is_idempotent_set_insertion() {
        let mut graph = DependencyGraph::new(["node1", "node2", "node3"]);
        graph.add_dependency("node2", "node1");
        graph.add_dependency("node3", "node1");
        graph.add_dependency("node3", "node2");
        graph.add_dependency("node3", "node2");

        let expected = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node2", "node1"), ("node3", "node1"), ("node3", "node2")],
        );
        assert_eq!(graph, expected);
    }

    #[test]
    #[should_panic(expected = "is not a vertex of the graph")]
    fn add_dependency_rejects_unknown_vertices() {
        let mut graph = DependencyGraph::new(["node1"]);
        graph.add_dependency("node1", "ghost");
    }

    #[test]
    fn remove_dependency_deletes_single_edges() {
        let full = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node2", "node1"), ("node3", "node1"), ("node3", "node2")],
        );

        let cases: Vec<(Vec<(&str, &str)>, DependencyGraph)> = vec![
            (vec![], full.clone()),
            (
                vec![("node2", "node1")],
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node3", "node1"), ("node3", "node2")],
                ),
            ),
            (
                vec![("node2", "node1"), ("node3", "node2"), ("node3", "node1")],
                DependencyGraph::new(["node1", "node2", "node3"]),
            ),
        ];

        for (removals, expected) in cases {
            let mut graph = full.clone();
            for (from, to) in removals {
                graph.remove_dependency(from, to);
            }
            assert_eq!(graph, expected);
        }
    }

    #[test]
    fn add_then_remove_is_identity_on_absent_edges() {
        let empty = DependencyGraph::new(["node1", "node2"]);

        let mut graph = empty.clone();
        graph.add_dependency("node2", "node1");
        graph.remove_dependency("node2", "node1");
        assert_eq!(graph, empty);

        let mut graph = empty.clone();
        graph.remove_dependency("node2", "node1");
        graph.add_dependency("node2", "node1");
        let mut expected = empty.clone();
        expected.add_dependency("node2", "node1");
        assert_eq!(graph, expected);
    }

    #[test]
    fn invert_dependency_flips_edges() {
        let start = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node2", "node1"), ("node3", "node1"), ("node3", "node2")],
        );

        let mut graph = start.clone();
        graph.invert_dependency("node2", "node1");
        assert_eq!(
            graph,
            graph_with_edges(
                &["node1", "node2", "node3"],
                &[("node1", "node2"), ("node3", "node1"), ("node3", "node2")],
            )
        );

        // Inverting twice restores the original edge.
        graph.invert_dependency("node1", "node2");
        assert_eq!(graph, start);
    }

    #[test]
    fn dependencies_of_returns_transitive_closure() {
        let graph = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node2", "node1"), ("node3", "node2")],
        );

        assert_eq!(graph.dependencies_of("node1"), BTreeSet::new());
        assert_eq!(
            graph.dependencies_of("node2"),
            BTreeSet::from(["node1".to_owned()])
        );
        assert_eq!(
            graph.dependencies_of("node3"),
            BTreeSet::from(["node1".to_owned(), "node2".to_owned()])
        );
    }

    #[test]
    fn dependencies_of_includes_self_on_cycles() {
        let graph = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node1", "node3"), ("node2", "node1"), ("node3", "node2")],
        );

        let all: BTreeSet<String> = ["node1", "node2", "node3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for node in ["node1", "node2", "node3"] {
            assert_eq!(graph.dependencies_of(node), all, "closure of {node}");
        }
    }

    #[test]
    fn transitive_reduction_drops_implied_edges() {
        let cases = [
            (
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node2", "node1"), ("node3", "node1"), ("node3", "node2")],
                ),
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node2", "node1"), ("node3", "node2")],
                ),
            ),
            (
                DependencyGraph::new(["node1", "node2", "node3"]),
                DependencyGraph::new(["node1", "node2", "node3"]),
            ),
            (
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node2", "node1"), ("node3", "node2")],
                ),
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node2", "node1"), ("node3", "node2")],
                ),
            ),
            (
                // A fork is already minimal.
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node3", "node1"), ("node3", "node2")],
                ),
                graph_with_edges(
                    &["node1", "node2", "node3"],
                    &[("node3", "node1"), ("node3", "node2")],
                ),
            ),
            (
                graph_with_edges(
                    &["node1", "node2", "node3", "node4", "node5"],
                    &[
                        ("node2", "node1"),
                        ("node3", "node1"),
                        ("node4", "node1"),
                        ("node4", "node3"),
                        ("node5", "node1"),
                        ("node5", "node2"),
                    ],
                ),
                graph_with_edges(
                    &["node1", "node2", "node3", "node4", "node5"],
                    &[
                        ("node2", "node1"),
                        ("node3", "node1"),
                        ("node4", "node3"),
                        ("node5", "node2"),
                    ],
                ),
            ),
        ];

        for (mut graph, expected) in cases {
            graph.transitive_reduction();
            assert_eq!(graph, expected);
        }
    }

    #[test]
    fn schedules_cover_every_test_with_its_prefix() {
        let tests: Vec<String> = ["node1", "node2", "node3"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let graph = DependencyGraph::new(tests.clone());
        let mut schedules = graph.schedules(&tests);
        schedules.sort();
        assert_eq!(
            schedules,
            vec![vec!["node1"], vec!["node2"], vec!["node3"]]
        );

        let chain = graph_with_edges(
            &["node1", "node2", "node3"],
            &[("node2", "node1"), ("node3", "node2")],
        );
        assert_eq!(
            chain.schedules(&tests),
            vec![vec!["node1", "node2", "node3"]]
        );

        let tests5: Vec<String> = ["node1", "node2", "node3", "node4", "node5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let forked = graph_with_edges(
            &["node1", "node2", "node3", "node4", "node5"],
            &[
                ("node2", "node1"),
                ("node3", "node1"),
                ("node4", "node1"),
                ("node4", "node3"),
                ("node5", "node1"),
                ("node5", "node2"),
            ],
        );
        let mut schedules = forked.schedules(&tests5);
        schedules.sort();
        assert_eq!(
            schedules,
            vec![
                vec!["node1", "node2", "node5"],
                vec!["node1", "node3", "node4"],
            ]
        );
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let graph = graph_with_edges(
            &["node1", "node2", "node3", "node4"],
            &[("node2", "node1"), ("node4", "node1"), ("node4", "node3")],
        );

        let mut buffer = Vec::new();
        graph.write_json(&mut buffer).unwrap();
        let parsed = DependencyGraph::from_json(buffer.as_slice()).unwrap();

        assert_eq!(parsed, graph);
    }

    #[test]
    fn from_json_rejects_unknown_tests() {
        let input = r#"{"node1": [], "node2": ["ghost"]}"#;
        let err = DependencyGraph::from_json(input.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            GraphParseError::UnknownTest { ref from, ref to } if from == "node2" && to == "ghost"
        ));

        let err = DependencyGraph::from_json("not json".as_bytes()).unwrap_err();
        assert!(matches!(err, GraphParseError::Json(_)));
    }

    #[test]
    fn dot_output_is_sorted_and_quoted() {
        let graph = graph_with_edges(
            &["b", "a", "c"],
            &[("c", "a"), ("c", "b"), ("b", "a")],
        );

        let mut buffer = Vec::new();
        graph.write_dot(&mut buffer).unwrap();

        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            indoc! {r#"
                digraph {
                    compound = "true"
                    newrank = "true"
                    subgraph "root" {
                        "a"
                        "b"
                        "c"
                        "b" -> "a"
                        "c" -> "a"
                        "c" -> "b"
                    }
                }
            "#}
        );
    }

    /// Builds a DAG over `n` tests from a boolean mask over the (j, i)
    /// pairs with j > i; edges always point backwards in suite order.
    fn dag_from_mask(n: usize, mask: &[bool]) -> DependencyGraph {
        let tests: Vec<String> = (0..n).map(|i| format!("test{i}")).collect();
        let mut graph = DependencyGraph::new(tests.clone());
        let mut k = 0;
        for j in 0..n {
            for i in 0..j {
                if mask.get(k).copied().unwrap_or(false) {
                    graph.add_dependency(&tests[j], &tests[i]);
                }
                k += 1;
            }
        }
        graph
    }

    proptest! {
        #[test]
        fn reduction_preserves_reachability(mask in prop::collection::vec(any::<bool>(), 28)) {
            let graph = dag_from_mask(8, &mask);
            let mut reduced = graph.clone();
            reduced.transitive_reduction();

            for test in graph.tests() {
                prop_assert_eq!(
                    graph.dependencies_of(test),
                    reduced.dependencies_of(test),
                    "closure of {} changed", test
                );
            }
        }

        #[test]
        fn reduction_is_idempotent(mask in prop::collection::vec(any::<bool>(), 28)) {
            let mut once = dag_from_mask(8, &mask);
            once.transitive_reduction();
            let mut twice = once.clone();
            twice.transitive_reduction();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn every_schedule_is_a_closure_prefix(mask in prop::collection::vec(any::<bool>(), 28)) {
            let tests: Vec<String> = (0..8).map(|i| format!("test{i}")).collect();
            let graph = dag_from_mask(8, &mask);

            for schedule in graph.schedules(&tests) {
                let (last, prefix) = schedule.split_last().unwrap();
                let closure = graph.dependencies_of(last);
                let expected: Vec<String> = tests
                    .iter()
                    .filter(|test| closure.contains(*test))
                    .cloned()
                    .collect();
                prop_assert_eq!(prefix.to_vec(), expected);
            }
        }
    }
}
