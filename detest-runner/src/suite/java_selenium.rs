// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter for Java/Selenium test suites packaged with their own Dockerfile.
//!
//! The suite image accepts `--list-tests` to enumerate tests, runs the tests
//! named on its command line, and finishes by printing one summary line per
//! test in the form `<test> <0|1>`.

use crate::{
    container::{AppDefinition, Client, RunOptions, ServiceDefinition},
    errors::SuiteError,
    suite::{SuiteRunConfig, TestSuite},
};
use async_trait::async_trait;
use camino::Utf8Path;
use regex::Regex;
use tracing::{debug, error};

/// A Java test suite driven through Selenium.
pub struct JavaSeleniumSuite {
    image: String,
    client: Client,
    summary_line: Regex,
}

impl JavaSeleniumSuite {
    /// Creates an adapter for the suite image with the given tag.
    pub fn new(image: String) -> Self {
        Self {
            image,
            client: Client::new(),
            summary_line: Regex::new("[a-zA-Z._0-9]+ (0|1)").expect("the summary pattern is valid"),
        }
    }

    async fn capture_output(
        &self,
        app: AppDefinition,
        service: &str,
        networks: Vec<String>,
    ) -> Result<String, SuiteError> {
        let instance = self
            .client
            .run_app(&app, &RunOptions {
                prefix: None,
                networks,
            })
            .await?;
        debug!("successfully started test suite container {service}");

        let container = instance
            .container(service)
            .expect("the app was built with this service");
        let logs = self.client.logs(container).await;

        if let Err(err) = self.client.remove_instance(&instance).await {
            error!("failed to delete test suite container: {err}");
        }

        Ok(logs?)
    }
}

#[async_trait]
impl TestSuite for JavaSeleniumSuite {
    async fn build(&self, path: &Utf8Path) -> Result<(), SuiteError> {
        self.client
            .build_image(&self.image, path, "Dockerfile")
            .await?;
        Ok(())
    }

    async fn list_tests(&self) -> Result<Vec<String>, SuiteError> {
        let app = AppDefinition::from_services([(
            "testsuite",
            ServiceDefinition {
                image: Some(self.image.clone()),
                command: Some(vec!["--list-tests".to_owned()]),
                ..Default::default()
            },
        )]);

        let logs = self.capture_output(app, "testsuite", Vec::new()).await?;
        Ok(logs
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn run(&self, config: &SuiteRunConfig) -> Result<Vec<bool>, SuiteError> {
        let app = AppDefinition::from_services([(
            config.name.clone(),
            ServiceDefinition {
                image: Some(self.image.clone()),
                command: Some(config.tests.clone()),
                environment: config.env.clone(),
                ..Default::default()
            },
        )]);

        let logs = self
            .capture_output(app, &config.name, config.networks.clone())
            .await?;
        parse_results(&self.summary_line, &logs, config.tests.len())
    }
}

/// Extracts the pass/fail vector from the trailing summary lines of the
/// suite output.
fn parse_results(
    summary_line: &Regex,
    logs: &str,
    expected: usize,
) -> Result<Vec<bool>, SuiteError> {
    let lines: Vec<&str> = logs.trim_matches('\n').lines().collect();
    if lines.len() < expected {
        return Err(SuiteError::MalformedOutput {
            reason: format!(
                "expected {expected} summary lines, the suite printed {}",
                lines.len()
            ),
        });
    }

    let results: Vec<bool> = lines[lines.len() - expected..]
        .iter()
        .filter(|line| summary_line.is_match(line))
        .map(|line| line.ends_with('1'))
        .collect();

    if results.len() != expected {
        return Err(SuiteError::MalformedOutput {
            reason: format!(
                "expected {expected} summary lines, found {}",
                results.len()
            ),
        });
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_line() -> Regex {
        Regex::new("[a-zA-Z._0-9]+ (0|1)").unwrap()
    }

    #[test]
    fn parses_trailing_summary_lines() {
        let logs = "starting selenium session\nLoginTest#testLogin 1\nCartTest#testAdd 0\n";
        // The '#' is not part of the summary pattern, but the line still
        // matches on the method-name half.
        let results = parse_results(&summary_line(), logs, 2).unwrap();
        assert_eq!(results, vec![true, false]);
    }

    #[test]
    fn rejects_short_output() {
        let logs = "suite.Login 1\n";
        let err = parse_results(&summary_line(), logs, 3).unwrap_err();
        assert!(matches!(err, SuiteError::MalformedOutput { .. }));
    }

    #[test]
    fn rejects_non_summary_trailers() {
        let logs = "suite.Login 1\nException in thread main\n";
        let err = parse_results(&summary_line(), logs, 2).unwrap_err();
        assert!(matches!(err, SuiteError::MalformedOutput { .. }));
    }
}
