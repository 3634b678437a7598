// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by detest.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error that occurred while assembling a detection run from user
/// configuration.
///
/// Configuration errors are never retried: they are surfaced to the caller
/// as-is.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A runner pool was requested with zero runners.
    #[error("a runner pool must have at least one runner")]
    PoolSizeZero,

    /// The requested test-suite type is not supported.
    #[error(
        "unrecognized test-suite type '{kind}' (known types: {})",
        crate::suite::KNOWN_SUITE_KINDS.join(", ")
    )]
    UnknownSuiteKind {
        /// The type that was requested.
        kind: String,
    },

    /// No test-suite type was provided and none could be inferred.
    #[error("no test-suite type provided")]
    MissingSuiteKind,

    /// An app or driver definition file could not be loaded.
    #[error("failed to load definition file `{path}`")]
    Definition {
        /// The path to the definition file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: AppDefinitionError,
    },
}

/// An error which indicates that a detection strategy was requested but is
/// not known to detest.
#[derive(Clone, Debug, Error)]
#[error(
    "dependency detection strategy '{name}' does not exist (known strategies: {})",
    known.join(", ")
)]
pub struct DetectorNotFound {
    pub(crate) name: String,
    pub(crate) known: Vec<&'static str>,
}

impl DetectorNotFound {
    /// Returns the name that was requested.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An error that occurred while reading a Docker Compose definition file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppDefinitionError {
    /// The file could not be read.
    #[error("failed to read definition file")]
    Read(#[source] io::Error),

    /// The file is not valid YAML, or does not describe a set of services.
    #[error("failed to parse definition file")]
    Parse(#[source] serde_yaml::Error),

    /// A duration field does not use the compose duration syntax.
    #[error("invalid duration '{value}' (expected e.g. \"30s\" or \"1m30s\")")]
    InvalidDuration {
        /// The offending value.
        value: String,
    },
}

/// An error returned by the container client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// The container CLI could not be spawned at all.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The container CLI exited with a failure status.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Trimmed standard error of the command.
        stderr: String,
    },

    /// A container state report could not be understood.
    #[error("failed to parse state of container {container}")]
    MalformedState {
        /// The container whose state was inspected.
        container: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A container entered a state from which it cannot become ready.
    #[error("container {container} cannot become ready: {reason}")]
    Unhealthy {
        /// The container that failed.
        container: String,
        /// Why the container is considered failed.
        reason: String,
    },

    /// A container wrote to its standard error stream.
    #[error("errors in the logs of container {container}: {stderr}")]
    ErrorLogs {
        /// The container whose logs were read.
        container: String,
        /// What the container wrote to standard error.
        stderr: String,
    },
}

/// An error raised by a test-suite adapter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteError {
    /// A container operation failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Scratch files needed to build the suite image could not be written.
    #[error("failed to write test-suite build files")]
    Scratch(#[source] io::Error),

    /// The test-suite output does not match the expected summary format.
    #[error("malformed test-suite output: {reason}")]
    MalformedOutput {
        /// What was wrong with the output.
        reason: String,
    },
}

/// An error that occurred while bringing up a runner.
///
/// Runner initialization failures are not fatal to the pool: the failed
/// runner is excluded and the pool continues with the remaining ones.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerInitError {
    /// The runner's private network could not be created.
    #[error("failed to create network for runner {runner}")]
    Network {
        /// The runner being constructed.
        runner: String,
        /// The underlying error.
        #[source]
        source: ContainerError,
    },

    /// The runner's driver could not be started.
    #[error("failed to start driver on runner {runner}")]
    Driver {
        /// The runner being constructed.
        runner: String,
        /// The underlying error.
        #[source]
        source: ContainerError,
    },
}

/// An error produced by a runner after it was successfully constructed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The application could not be reset to its initial state.
    #[error("failed to reset application on runner {runner}")]
    Reset {
        /// The runner that failed.
        runner: String,
        /// The underlying error.
        #[source]
        source: ContainerError,
    },

    /// The test suite could not be run to completion.
    #[error("failed to run test suite on runner {runner}")]
    Suite {
        /// The runner that failed.
        runner: String,
        /// The underlying error.
        #[source]
        source: SuiteError,
    },

    /// The runner's resources could not be released.
    #[error("failed to delete runner {runner}")]
    Destroy {
        /// The runner that failed.
        runner: String,
        /// The underlying error.
        #[source]
        source: ContainerError,
    },
}

/// An error returned by [`Oracle::run_schedule`](crate::oracle::Oracle).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OracleError {
    /// The pool has no runner left to reserve.
    #[error("no runner to reserve")]
    NoRunner,

    /// A runner failed while executing the schedule.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// An error that occurred while deserializing a dependency graph.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphParseError {
    /// The input is not a JSON object of string arrays.
    #[error("failed to decode graph JSON data")]
    Json(#[source] serde_json::Error),

    /// An edge points at a test that is not a vertex of the graph.
    #[error("test '{from}' depends on '{to}', which is not in the test suite")]
    UnknownTest {
        /// The test declaring the dependency.
        from: String,
        /// The unknown dependency.
        to: String,
    },
}
