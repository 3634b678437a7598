// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter for plain JUnit 4 test suites.
//!
//! JUnit suites do not ship a Dockerfile of their own; the adapter generates
//! one that compiles the suite with Maven, bakes in a small `JUnitCore`
//! driver able to run `Class#method` identifiers one by one, and exposes the
//! same `--list`/run/summary contract the rest of the system expects.

use crate::{
    container::{AppDefinition, Client, RunOptions, ServiceDefinition},
    errors::SuiteError,
    suite::{SuiteRunConfig, TestSuite},
};
use async_trait::async_trait;
use camino::Utf8Path;
use std::io::Write;
use tracing::{debug, error};

/// Lists `Class#method` identifiers by scraping the surefire XML reports
/// produced by the image build's `mvn test` run.
const LIST_TESTS_SCRIPT: &str = r##"#!/bin/sh
find target/ -name 'TEST*.xml' -exec grep testcase {} \; | awk -F'"' '{
    for (i = 1; i <= NF; i++) {
      if ($i ~ /classname=/) {
         classname=$(i+1)
      } else if ($i ~ /name=/) {
         name=$(i+1)
      }
    }
    if (classname && name) { print classname "#" name }
  }' | uniq
"##;

/// Runs the requested tests through the baked-in driver and prints the
/// summary it leaves behind.
const RUN_TESTS_SCRIPT: &str = r#"#!/bin/sh
java -cp "/app/junit-4.12.jar:$(cat cp.txt):/app/target/test-classes/:/app/target/classes/:" CustomRunner "$@" >/dev/null
cat summary.txt
"#;

/// A `JUnitCore` driver that runs each `Class#method` argument in order and
/// writes `<test> <0|1>` lines to `summary.txt`.
const JUNIT_RUNNER: &str = r##"import org.junit.runner.JUnitCore;
import org.junit.runner.Request;
import org.junit.runner.Result;
import java.io.PrintWriter;
import java.io.FileWriter;
import java.io.IOException;

public class CustomRunner {
    public static void main(final String[] args) throws ClassNotFoundException {
        JUnitCore core = new JUnitCore();
        final boolean[] results = new boolean[args.length];

        for (int i = 0; i < args.length; ++i) {
            String[] classAndMethod = args[i].split("#");
            Request request = Request.method(Class.forName(classAndMethod[0]),
                classAndMethod[1]);

            Result result = core.run(request);
            results[i] = result.wasSuccessful();
        }

        try {
            PrintWriter out = new PrintWriter(new FileWriter("summary.txt"));

            for (int i = 0; i < results.length; ++i)
                out.println(String.format("%s %d", args[i], results[i] ? 1 : 0));

            out.close();
        } catch (IOException e) {
            System.exit(1);
        }
        System.exit(0);
    }
}
"##;

/// A JUnit 4 test suite.
pub struct JunitSuite {
    image: String,
    client: Client,
}

impl JunitSuite {
    /// Creates an adapter for the suite image with the given tag.
    pub fn new(image: String) -> Self {
        Self {
            image,
            client: Client::new(),
        }
    }

    fn dockerfile(path: &Utf8Path) -> String {
        format!(
            r#"FROM maven:3.6.1-jdk-8

COPY {path}/ /app
WORKDIR /app

RUN curl -O https://repo1.maven.org/maven2/junit/junit/4.12/junit-4.12.jar
RUN mvn clean test
RUN mvn dependency:build-classpath -DincludeScope=test -Dmdep.outputFile=cp.txt

COPY <<"DETEST_LIST" /app/list_tests.sh
{LIST_TESTS_SCRIPT}DETEST_LIST
COPY <<"DETEST_RUNNER" /app/CustomRunner.java
{JUNIT_RUNNER}DETEST_RUNNER
COPY <<"DETEST_RUN" /app/run_tests.sh
{RUN_TESTS_SCRIPT}DETEST_RUN

RUN chmod +x list_tests.sh run_tests.sh
RUN javac -cp "/app/junit-4.12.jar:$(cat cp.txt):" CustomRunner.java
"#
        )
    }

    async fn capture_output(
        &self,
        command: Vec<String>,
        name: &str,
        env: Vec<String>,
        networks: Vec<String>,
    ) -> Result<String, SuiteError> {
        let app = AppDefinition::from_services([(
            name,
            ServiceDefinition {
                image: Some(self.image.clone()),
                command: Some(command),
                environment: env,
                ..Default::default()
            },
        )]);

        let instance = self
            .client
            .run_app(&app, &RunOptions {
                prefix: None,
                networks,
            })
            .await?;
        debug!("successfully started JUnit test suite container {name}");

        let container = instance
            .container(name)
            .expect("the app was built with this service");
        let logs = self.client.logs(container).await;

        if let Err(err) = self.client.remove_instance(&instance).await {
            error!("failed to delete JUnit test suite container: {err}");
        }

        Ok(logs?)
    }
}

#[async_trait]
impl TestSuite for JunitSuite {
    async fn build(&self, path: &Utf8Path) -> Result<(), SuiteError> {
        // The generated Dockerfile copies the suite sources by path, so the
        // build context is the working directory that contains them.
        let mut scratch = camino_tempfile::Builder::new()
            .prefix("detest-junit-")
            .suffix(".dockerfile")
            .tempfile_in(".")
            .map_err(SuiteError::Scratch)?;
        scratch
            .write_all(Self::dockerfile(path).as_bytes())
            .map_err(SuiteError::Scratch)?;

        let dockerfile = scratch
            .path()
            .file_name()
            .expect("tempfile always has a file name")
            .to_owned();
        self.client
            .build_image(&self.image, Utf8Path::new("."), &dockerfile)
            .await?;
        Ok(())
    }

    async fn list_tests(&self) -> Result<Vec<String>, SuiteError> {
        let logs = self
            .capture_output(
                vec!["./list_tests.sh".to_owned()],
                "testsuite",
                Vec::new(),
                Vec::new(),
            )
            .await?;

        Ok(logs
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn run(&self, config: &SuiteRunConfig) -> Result<Vec<bool>, SuiteError> {
        let mut command = vec!["./run_tests.sh".to_owned()];
        command.extend(config.tests.iter().cloned());

        let logs = self
            .capture_output(
                command,
                &config.name,
                config.env.clone(),
                config.networks.clone(),
            )
            .await?;
        parse_summary(&logs, config.tests.len())
    }
}

/// Parses the `<test> <0|1>` summary emitted by the baked-in driver.
fn parse_summary(logs: &str, expected: usize) -> Result<Vec<bool>, SuiteError> {
    let results: Vec<bool> = logs
        .trim_matches('\n')
        .lines()
        .map(|line| line.ends_with('1'))
        .collect();

    if results.len() != expected {
        return Err(SuiteError::MalformedOutput {
            reason: format!(
                "expected {expected} summary lines, the suite printed {}",
                results.len()
            ),
        });
    }

    Ok(results)
}
