// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and subcommand dispatch.

use crate::output::{OutputContext, OutputOpts, StderrStyles};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::bail, Result};
use detest_runner::{
    container::AppDefinition,
    detect::Detector,
    graph::DependencyGraph,
    runner::{ComposeRunner, ComposeRunnerBuilder, RunnerPool, DEFAULT_POOL_SIZE},
    suite::{suite_for, TestSuite},
};
use futures::future;
use owo_colors::OwoColorize;
use serde::Deserialize;
use std::{fs::File, io, sync::Arc, time::Duration};
use tracing::{error, info};

/// A detector of hidden ordering dependencies between the tests of a test
/// suite.
#[derive(Debug, Parser)]
#[command(name = "detest", version, about)]
pub struct DetestApp {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = ".detest.toml")]
    config: Utf8PathBuf,

    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl DetestApp {
    /// Executes the app.
    pub fn exec(self) -> Result<()> {
        let output = self.output.init();
        let settings = Settings::load(&self.config)?;

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.command.exec(&settings, output))
    }
}

/// Defaults read from the configuration file and `DETEST_*` environment
/// variables; command-line flags win over both.
#[derive(Debug, Default, Deserialize)]
struct Settings {
    runners: Option<usize>,
    strategy: Option<String>,
    suite_type: Option<String>,
    driver: Option<Utf8PathBuf>,
    env: Option<Vec<String>>,
}

impl Settings {
    fn load(path: &Utf8Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path.as_str(), config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("DETEST")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("env"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[derive(Debug, Args)]
struct SuiteOpts {
    /// Path to the test suite
    #[arg(value_name = "PATH")]
    path: Utf8PathBuf,

    /// The test suite type
    #[arg(short = 't', long, value_name = "TYPE")]
    suite_type: Option<String>,
}

impl SuiteOpts {
    fn suite(&self, settings: &Settings) -> Result<Arc<dyn TestSuite>> {
        let kind = self
            .suite_type
            .as_deref()
            .or(settings.suite_type.as_deref())
            .ok_or(detest_runner::errors::ConfigError::MissingSuiteKind)?;
        Ok(suite_for(&self.path, kind)?)
    }
}

#[derive(Debug, Args)]
struct PoolOpts {
    /// An environment variable to pass to the test suite container
    #[arg(short, long, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// The path to a Docker Compose file configuring the driver
    #[arg(short, long, value_name = "PATH")]
    driver: Option<Utf8PathBuf>,

    /// The number of concurrent runners
    #[arg(short, long, value_name = "N")]
    runners: Option<usize>,
}

impl PoolOpts {
    /// Builds the runner pool for a suite: the app definition is the
    /// suite's own `docker-compose.yml` when it has one.
    async fn build_pool(
        &self,
        suite_path: &Utf8Path,
        suite: Arc<dyn TestSuite>,
        settings: &Settings,
    ) -> Result<RunnerPool<ComposeRunner>> {
        let mut builder = ComposeRunnerBuilder::new(suite);

        let app_definition = suite_path.join("docker-compose.yml");
        if app_definition.is_file() {
            builder = builder.with_app_definition(&app_definition)?;
        }

        let driver = self.driver.as_ref().or(settings.driver.as_ref());
        if let Some(driver) = driver {
            builder = builder.with_driver_definition(driver)?;
        }

        let mut env = self.env.clone();
        if env.is_empty() {
            env = settings.env.clone().unwrap_or_default();
        }
        builder = builder.with_env(env);

        let size = self
            .runners
            .or(settings.runners)
            .unwrap_or(DEFAULT_POOL_SIZE);
        Ok(builder.build_pool(size).await?)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Builds the artifacts needed to run a test suite
    Build {
        #[clap(flatten)]
        suite_opts: SuiteOpts,
    },

    /// Finds all the dependencies between tests in a test suite
    Deps {
        #[clap(flatten)]
        suite_opts: SuiteOpts,

        #[clap(flatten)]
        pool_opts: PoolOpts,

        /// The strategy to detect dependencies between tests
        #[arg(short, long, value_name = "STRATEGY")]
        strategy: Option<String>,

        /// The file used to output the resulting dependency graph
        #[arg(short, long, value_name = "PATH", default_value = "graph.json")]
        output: Utf8PathBuf,
    },

    /// Generates a Graphviz graph of the dependencies between tests
    Graph {
        /// Path to the JSON graph file
        #[arg(value_name = "PATH")]
        graph: Utf8PathBuf,
    },

    /// Runs a test suite with parallel schedules computed from a graph
    Run {
        #[clap(flatten)]
        suite_opts: SuiteOpts,

        #[clap(flatten)]
        pool_opts: PoolOpts,

        /// The file containing the graph of dependencies
        #[arg(short, long, value_name = "PATH")]
        graph: Option<Utf8PathBuf>,
    },

    /// Computes the parallel schedules implied by a dependency graph
    Schedules {
        #[clap(flatten)]
        suite_opts: SuiteOpts,

        /// The file containing the graph of dependencies
        #[arg(short, long, value_name = "PATH", default_value = "graph.json")]
        input: Utf8PathBuf,

        /// Where to write the resulting schedules; stdout when omitted
        #[arg(short, long, value_name = "PATH")]
        output: Option<Utf8PathBuf>,
    },

    /// Runs the test suite repeatedly in its original order to surface
    /// flakiness
    Flaky {
        #[clap(flatten)]
        suite_opts: SuiteOpts,

        #[clap(flatten)]
        pool_opts: PoolOpts,
    },
}

impl Command {
    async fn exec(self, settings: &Settings, output: OutputContext) -> Result<()> {
        let styles = output.stderr_styles();

        match self {
            Command::Build { suite_opts } => {
                let suite = suite_opts.suite(settings)?;

                let app_definition = suite_opts.path.join("docker-compose.yml");
                let validate_app = async {
                    if app_definition.is_file() {
                        AppDefinition::load(&app_definition).map_err(|source| {
                            detest_runner::errors::ConfigError::Definition {
                                path: app_definition.clone(),
                                source,
                            }
                        })?;
                    }
                    Ok::<_, color_eyre::eyre::Report>(())
                };

                let build_suite = async {
                    suite.build(&suite_opts.path).await?;
                    Ok::<_, color_eyre::eyre::Report>(())
                };

                tokio::try_join!(validate_app, build_suite)?;
                info!("artifacts build was successful");
                Ok(())
            }

            Command::Deps {
                suite_opts,
                pool_opts,
                strategy,
                output,
            } => {
                let detector: Detector = strategy
                    .as_deref()
                    .or(settings.strategy.as_deref())
                    .unwrap_or("pfast")
                    .parse()?;

                let suite = suite_opts.suite(settings)?;
                let tests = suite.list_tests().await?;

                let pool = Arc::new(
                    pool_opts
                        .build_pool(&suite_opts.path, suite, settings)
                        .await?,
                );
                let detected = detector.detect(&tests, &pool).await;
                if let Err(err) = pool.delete().await {
                    error!("failed to delete runner pool: {err}");
                }

                let mut graph = detected?;
                graph.transitive_reduction();

                let mut file = File::create(&output)?;
                graph.write_json(&mut file)?;
                info!("dependency graph written to {output}");
                Ok(())
            }

            Command::Graph { graph } => {
                let graph = DependencyGraph::from_json(File::open(&graph)?)?;
                graph.write_dot(&mut io::stdout().lock())?;
                Ok(())
            }

            Command::Run {
                suite_opts,
                pool_opts,
                graph,
            } => {
                let suite = suite_opts.suite(settings)?;
                let tests = suite.list_tests().await?;
                let schedules = schedules_for(&tests, graph.as_deref())?;

                let pool = pool_opts
                    .build_pool(&suite_opts.path, suite, settings)
                    .await?;
                let outcome = run_schedules(&pool, schedules, &styles).await;
                if let Err(err) = pool.delete().await {
                    error!("failed to delete runner pool: {err}");
                }

                let duration = outcome?;
                info!("expected running time {duration:?}");
                Ok(())
            }

            Command::Schedules {
                suite_opts,
                input,
                output,
            } => {
                let suite = suite_opts.suite(settings)?;
                let tests = suite.list_tests().await?;
                let schedules = schedules_for(&tests, Some(input.as_path()))?;

                match output {
                    Some(path) => {
                        let mut file = File::create(&path)?;
                        write_schedules(&mut file, &schedules)?;
                    }
                    None => write_schedules(&mut io::stdout().lock(), &schedules)?,
                }
                Ok(())
            }

            Command::Flaky {
                suite_opts,
                pool_opts,
            } => {
                let suite = suite_opts.suite(settings)?;
                let tests = suite.list_tests().await?;

                let pool = pool_opts
                    .build_pool(&suite_opts.path, suite, settings)
                    .await?;
                let outcome = check_flakiness(&pool, &tests, &styles).await;
                if let Err(err) = pool.delete().await {
                    error!("failed to delete runner pool: {err}");
                }

                outcome
            }
        }
    }
}

/// The schedules to execute: the ones implied by a graph file, or the
/// original order when no graph is given.
fn schedules_for(tests: &[String], graph: Option<&Utf8Path>) -> Result<Vec<Vec<String>>> {
    match graph {
        None => Ok(vec![tests.to_vec()]),
        Some(path) => {
            let graph = DependencyGraph::from_json(File::open(path)?)?;
            Ok(graph.schedules(tests))
        }
    }
}

fn write_schedules(writer: &mut dyn io::Write, schedules: &[Vec<String>]) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, schedules)?;
    writeln!(writer)?;
    Ok(())
}

/// Runs every schedule across the pool and reports the expected wall-clock
/// time: the duration of the slowest schedule.
async fn run_schedules(
    pool: &RunnerPool<ComposeRunner>,
    schedules: Vec<Vec<String>>,
    styles: &StderrStyles,
) -> Result<Duration> {
    let runs = schedules.into_iter().map(|schedule| async move {
        let outcome = pool.run_schedule(schedule.clone()).await;
        (schedule, outcome)
    });

    let mut duration = Duration::ZERO;
    let mut failures = Vec::new();
    for (schedule, outcome) in future::join_all(runs).await {
        let outcome = outcome?;

        if let Some(failed) = outcome.results.iter().position(|passed| !passed) {
            failures.push(format!(
                "test {} failed in schedule {:?}",
                schedule[failed], schedule
            ));
        }

        info!("run schedule in {:?}", outcome.elapsed);
        duration = duration.max(outcome.elapsed);
    }

    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("{}", failure.style(styles.failure));
        }
        bail!(
            "{} schedules had failing tests",
            failures.len().style(styles.count)
        );
    }

    Ok(duration)
}

/// Runs the original-order schedule at increasing parallelism; any failure
/// means the suite misbehaves without reordering, i.e. it is flaky.
async fn check_flakiness(
    pool: &RunnerPool<ComposeRunner>,
    tests: &[String],
    styles: &StderrStyles,
) -> Result<()> {
    for parallelism in 1..=pool.size() {
        let runs = (0..parallelism).map(|_| pool.run_schedule(tests.to_vec()));

        let mut failures = Vec::new();
        for outcome in future::join_all(runs).await {
            let outcome = outcome?;
            if let Some(failed) = outcome.results.iter().position(|passed| !passed) {
                failures.push(format!(
                    "test {} failed in schedule {tests:?}",
                    tests[failed]
                ));
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                eprintln!("{}", failure.style(styles.failure));
            }
            bail!("the test suite is flaky at parallelism {parallelism}");
        }

        info!("test suite is not flaky with parallelism {parallelism}");
    }

    Ok(())
}
