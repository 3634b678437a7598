// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test-suite adapters.
//!
//! A test suite is anything that can build its own artifacts, enumerate its
//! tests in execution order, and run an arbitrary subsequence of them
//! reporting one boolean per test. The rest of the system never looks past
//! this capability.

mod java_selenium;
mod junit;

pub use java_selenium::JavaSeleniumSuite;
pub use junit::JunitSuite;

use crate::errors::{ConfigError, SuiteError};
use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;

/// The test-suite kinds understood by [`suite_for`].
pub const KNOWN_SUITE_KINDS: &[&str] = &["java-selenium", "junit"];

/// The configuration passed to a test suite when it is run.
#[derive(Clone, Debug)]
pub struct SuiteRunConfig {
    /// The name given to the container running the suite.
    pub name: String,
    /// Environment variables passed to the suite container.
    pub env: Vec<String>,
    /// The tests to run, in order.
    pub tests: Vec<String>,
    /// Networks the suite container is attached to.
    pub networks: Vec<String>,
}

/// The operations supported by a generic test suite.
#[async_trait]
pub trait TestSuite: Send + Sync {
    /// Creates the artifacts needed to run the test suite from its source
    /// directory.
    async fn build(&self, path: &Utf8Path) -> Result<(), SuiteError>;

    /// Returns all tests declared in the suite, in the order they normally
    /// run.
    async fn list_tests(&self) -> Result<Vec<String>, SuiteError>;

    /// Runs the given tests and reports one boolean per test; `true` means
    /// the test passed.
    async fn run(&self, config: &SuiteRunConfig) -> Result<Vec<bool>, SuiteError>;
}

/// Creates the test suite adapter for a suite directory and kind.
pub fn suite_for(path: &Utf8Path, kind: &str) -> Result<Arc<dyn TestSuite>, ConfigError> {
    let image = image_tag(path);

    match kind {
        "java-selenium" => Ok(Arc::new(JavaSeleniumSuite::new(image))),
        "junit" => Ok(Arc::new(JunitSuite::new(image))),
        _ => Err(ConfigError::UnknownSuiteKind {
            kind: kind.to_owned(),
        }),
    }
}

/// The image tag for a suite: the lowercased basename of its directory.
fn image_tag(path: &Utf8Path) -> String {
    path.file_name()
        .filter(|name| *name != "." && *name != "..")
        .map(str::to_lowercase)
        .unwrap_or_else(|| "testsuite".to_owned())
}
