// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The container-backed runner implementation.

use crate::{
    container::{AppDefinition, AppInstance, Client, RunOptions},
    errors::{ConfigError, RunnerError, RunnerInitError},
    runner::{pool::RunnerPool, Runner},
    suite::{SuiteRunConfig, TestSuite},
};
use camino::Utf8Path;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// An environment where a test suite can be run: a private network hosting
/// one instance of the application under test and, optionally, a driver
/// (e.g. a WebDriver for browser suites).
pub struct ComposeRunner {
    id: String,
    client: Client,
    /// The network every container of this runner is attached to.
    network: String,
    app_definition: AppDefinition,
    /// The application currently running; replaced on every reset.
    app: AppInstance,
    driver: AppInstance,
    suite: Arc<dyn TestSuite>,
    /// Environment for the suite container, with service hostnames
    /// rewritten to this runner's container names.
    translated_env: Vec<String>,
}

impl Runner for ComposeRunner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn reset(&mut self) -> Result<(), RunnerError> {
        self.client
            .remove_instance(&self.app)
            .await
            .map_err(|source| RunnerError::Reset {
                runner: self.id.clone(),
                source,
            })?;

        self.app = self
            .client
            .run_app(
                &self.app_definition,
                &RunOptions {
                    prefix: Some(self.id.clone()),
                    networks: vec![self.network.clone()],
                },
            )
            .await
            .map_err(|source| RunnerError::Reset {
                runner: self.id.clone(),
                source,
            })?;
        debug!("[runner={}] successfully reset app", self.id);

        Ok(())
    }

    async fn run(&self, tests: &[String]) -> Result<Vec<bool>, RunnerError> {
        self.suite
            .run(&SuiteRunConfig {
                name: format!("{}-testsuite", self.id),
                env: self.translated_env.clone(),
                tests: tests.to_vec(),
                networks: vec![self.network.clone()],
            })
            .await
            .map_err(|source| RunnerError::Suite {
                runner: self.id.clone(),
                source,
            })
    }

    async fn destroy(self) -> Result<(), RunnerError> {
        let wrap = |source| RunnerError::Destroy {
            runner: self.id.clone(),
            source,
        };

        self.client.remove_instance(&self.driver).await.map_err(wrap)?;
        debug!("[runner={}] successfully deleted driver", self.id);

        self.client.remove_instance(&self.app).await.map_err(wrap)?;
        debug!("[runner={}] successfully deleted app", self.id);

        self.client.network_remove(&self.network).await.map_err(wrap)?;
        debug!("[runner={}] successfully deleted network", self.id);

        Ok(())
    }
}

/// Builds [`ComposeRunner`]s, and pools of them.
#[derive(Clone)]
pub struct ComposeRunnerBuilder {
    suite: Arc<dyn TestSuite>,
    app: AppDefinition,
    driver: Option<AppDefinition>,
    env: Vec<String>,
}

impl ComposeRunnerBuilder {
    /// Creates a builder for runners hosting the given test suite.
    pub fn new(suite: Arc<dyn TestSuite>) -> Self {
        Self {
            suite,
            app: AppDefinition::default(),
            driver: None,
            env: Vec::new(),
        }
    }

    /// Loads the application definition the runners will host.
    pub fn with_app_definition(mut self, path: &Utf8Path) -> Result<Self, ConfigError> {
        self.app = AppDefinition::load(path).map_err(|source| ConfigError::Definition {
            path: path.to_owned(),
            source,
        })?;
        Ok(self)
    }

    /// Loads the driver definition started once per runner.
    pub fn with_driver_definition(mut self, path: &Utf8Path) -> Result<Self, ConfigError> {
        let driver = AppDefinition::load(path).map_err(|source| ConfigError::Definition {
            path: path.to_owned(),
            source,
        })?;
        self.driver = Some(driver);
        Ok(self)
    }

    /// Environment variables passed to the test-suite container.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Builds a single runner: create its network, start its driver, and
    /// precompute the runner-qualified environment. The app itself is
    /// started by the first reset.
    pub async fn build(&self, id: String) -> Result<ComposeRunner, RunnerInitError> {
        let client = Client::new();

        let network = client
            .network_create(&id)
            .await
            .map_err(|source| RunnerInitError::Network {
                runner: id.clone(),
                source,
            })?;
        debug!("[runner={id}] successfully created network {network}");

        let driver = match &self.driver {
            Some(definition) => {
                match client
                    .run_app(
                        definition,
                        &RunOptions {
                            prefix: Some(id.clone()),
                            networks: vec![network.clone()],
                        },
                    )
                    .await
                {
                    Ok(instance) => instance,
                    Err(source) => {
                        let _ = client.network_remove(&network).await;
                        return Err(RunnerInitError::Driver { runner: id, source });
                    }
                }
            }
            None => AppInstance::default(),
        };

        let translated_env = translate_env(&self.env, self.service_names(), &id);

        Ok(ComposeRunner {
            id,
            client,
            network,
            app_definition: self.app.clone(),
            app: AppInstance::default(),
            driver,
            suite: Arc::clone(&self.suite),
            translated_env,
        })
    }

    /// Builds a pool of `size` runners sharing this configuration.
    pub async fn build_pool(self, size: usize) -> Result<RunnerPool<ComposeRunner>, ConfigError> {
        let builder = Arc::new(self);
        RunnerPool::new(size, move |id| {
            let builder = Arc::clone(&builder);
            async move { builder.build(id).await }
        })
        .await
    }

    fn service_names(&self) -> Vec<&str> {
        self.app
            .service_names()
            .chain(self.driver.iter().flat_map(AppDefinition::service_names))
            .collect()
    }
}

/// Rewrites each whole-word occurrence of a service name within the value
/// of each environment variable to the runner-qualified container name
/// `<runner>-<service>`, so configurations address containers unambiguously
/// across runners.
fn translate_env(variables: &[String], hosts: Vec<&str>, runner: &str) -> Vec<String> {
    let patterns: Vec<(Regex, String)> = hosts
        .into_iter()
        .map(|host| {
            let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(host)))
                .expect("escaped service names are valid patterns");
            (pattern, format!("{runner}-{host}"))
        })
        .collect();

    variables
        .iter()
        .map(|variable| match variable.split_once('=') {
            Some((key, value)) => {
                let mut value = value.to_owned();
                for (pattern, replacement) in &patterns {
                    value = pattern.replace_all(&value, replacement.as_str()).into_owned();
                }
                format!("{key}={value}")
            }
            None => variable.clone(),
        })
        .collect()
}
