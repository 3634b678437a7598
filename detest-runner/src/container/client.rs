// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A thin client around the Docker CLI.
//!
//! Every operation shells out to `docker` (or whatever `DETEST_DOCKER`
//! points at) through [`tokio::process::Command`] with captured output.

use crate::{
    container::app::{AppDefinition, AppInstance, Healthcheck, ServiceDefinition},
    errors::ContainerError,
};
use camino::Utf8Path;
use futures::future;
use serde::Deserialize;
use std::{env, ffi::OsStr, time::Duration};
use tokio::process::Command;
use tracing::{debug, error};

/// How long to sleep between readiness probes when a service declares no
/// healthcheck interval.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Options applied when starting the containers of an app.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Prepended to container names as `<prefix>-<service>`, so several
    /// runners can host the same app side by side.
    pub prefix: Option<String>,
    /// Networks every container of the app is attached to.
    pub networks: Vec<String>,
}

/// A handle to the container runtime.
#[derive(Clone, Debug)]
pub struct Client {
    program: String,
}

impl Client {
    /// Creates a new client. The CLI binary defaults to `docker` and can be
    /// overridden through the `DETEST_DOCKER` environment variable.
    pub fn new() -> Self {
        Self {
            program: env::var("DETEST_DOCKER").unwrap_or_else(|_| "docker".to_owned()),
        }
    }

    async fn exec<I, S>(&self, args: I) -> Result<String, ContainerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);
        let rendered = format!("{:?}", command.as_std());

        let output = command
            .output()
            .await
            .map_err(|source| ContainerError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Creates a network and returns its identifier.
    pub async fn network_create(&self, name: &str) -> Result<String, ContainerError> {
        let id = self.exec(["network", "create", name]).await?;
        Ok(id.trim().to_owned())
    }

    /// Removes a network.
    pub async fn network_remove(&self, network: &str) -> Result<(), ContainerError> {
        self.exec(["network", "rm", network]).await?;
        Ok(())
    }

    /// Builds an image from a context directory and tags it.
    pub async fn build_image(
        &self,
        image: &str,
        context: &Utf8Path,
        dockerfile: &str,
    ) -> Result<(), ContainerError> {
        let dockerfile = context.join(dockerfile);
        self.exec([
            "build",
            "--force-rm",
            "--quiet",
            "--tag",
            image,
            "--file",
            dockerfile.as_str(),
            context.as_str(),
        ])
        .await?;
        Ok(())
    }

    /// Starts every service of an app and waits until all of them are
    /// ready: running, exited cleanly, or healthy per their healthcheck.
    ///
    /// On failure, containers that did come up are removed before the first
    /// error is returned.
    pub async fn run_app(
        &self,
        app: &AppDefinition,
        options: &RunOptions,
    ) -> Result<AppInstance, ContainerError> {
        let mut instance = AppInstance::default();

        let startups = app
            .services()
            .map(|(name, service)| self.start_service(name, service, options));
        let mut first_error = None;

        for (result, (name, _)) in future::join_all(startups).await.into_iter().zip(app.services())
        {
            match result {
                Ok(container) => {
                    debug!("successfully started service {name} as container {container}");
                    instance.insert(name.to_owned(), container);
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(_) => {}
            }
        }

        if let Some(err) = first_error {
            if let Err(delete_err) = self.remove_instance(&instance).await {
                error!("failed to delete partially started app: {delete_err}");
            }
            return Err(err);
        }

        Ok(instance)
    }

    async fn start_service(
        &self,
        name: &str,
        service: &ServiceDefinition,
        options: &RunOptions,
    ) -> Result<String, ContainerError> {
        let container = match &options.prefix {
            Some(prefix) => format!("{prefix}-{name}"),
            None => name.to_owned(),
        };

        let mut args: Vec<String> = vec!["create".into(), "--name".into(), container.clone()];

        let mut command_tail: Vec<String> = Vec::new();
        if let Some(entrypoint) = &service.entrypoint {
            if let Some((head, rest)) = entrypoint.split_first() {
                args.push("--entrypoint".into());
                args.push(head.clone());
                command_tail.extend(rest.iter().cloned());
            }
        }

        for variable in &service.environment {
            args.push("--env".into());
            args.push(variable.clone());
        }

        if let Some(shm_size) = &service.shm_size {
            args.push("--shm-size".into());
            args.push(shm_size.clone());
        }

        if let Some(healthcheck) = &service.healthcheck {
            push_health_flags(&mut args, healthcheck);
        }

        let image = service
            .image_name(name)
            .ok_or_else(|| ContainerError::Unhealthy {
                container: container.clone(),
                reason: "service declares neither an image nor a build context".to_owned(),
            })?;
        args.push(image);
        args.extend(command_tail);
        if let Some(command) = &service.command {
            args.extend(command.iter().cloned());
        }

        self.exec(&args).await?;

        match self.bring_up(&container, service, options).await {
            Ok(()) => Ok(container),
            Err(err) => {
                if let Err(remove_err) = self.remove_container(&container).await {
                    error!("failed to delete failed container {container}: {remove_err}");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        container: &str,
        service: &ServiceDefinition,
        options: &RunOptions,
    ) -> Result<(), ContainerError> {
        for network in &options.networks {
            self.exec(["network", "connect", network.as_str(), container])
                .await?;
        }
        self.exec(["start", container]).await?;
        self.wait_ready(container, service.healthcheck.as_ref()).await
    }

    async fn wait_ready(
        &self,
        container: &str,
        healthcheck: Option<&Healthcheck>,
    ) -> Result<(), ContainerError> {
        if let Some(start_period) = healthcheck.and_then(|h| h.start_period) {
            tokio::time::sleep(start_period).await;
        }

        let interval = healthcheck
            .and_then(|h| h.interval)
            .unwrap_or(DEFAULT_PROBE_INTERVAL);

        loop {
            if self.is_ready(container, healthcheck).await? {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Reads a container's state and decides whether it is ready, not yet
    /// ready, or permanently failed.
    async fn is_ready(
        &self,
        container: &str,
        healthcheck: Option<&Healthcheck>,
    ) -> Result<bool, ContainerError> {
        let state = self.inspect_state(container).await?;

        let Some(health) = &state.health else {
            return match state.status.as_str() {
                "exited" => {
                    if state.exit_code == 0 {
                        Ok(true)
                    } else {
                        Err(ContainerError::Unhealthy {
                            container: container.to_owned(),
                            reason: format!(
                                "the container exited with status code {}",
                                state.exit_code
                            ),
                        })
                    }
                }
                "paused" | "restarting" | "removing" | "dead" => Err(ContainerError::Unhealthy {
                    container: container.to_owned(),
                    reason: format!("the container is in state: {}", state.status),
                }),
                status => Ok(status == "running"),
            };
        };

        if health.status == "healthy" {
            return Ok(true);
        }

        // Docker's own default probe budget is three attempts.
        let retries = healthcheck.and_then(|h| h.retries).unwrap_or(3);
        if health.failing_streak >= retries && retries > 0 {
            let logs: Vec<&str> = health.log.iter().map(|entry| entry.output.as_str()).collect();
            return Err(ContainerError::Unhealthy {
                container: container.to_owned(),
                reason: format!("container healthcheck failing: {}", logs.join(" ")),
            });
        }

        Ok(false)
    }

    async fn inspect_state(&self, container: &str) -> Result<ContainerState, ContainerError> {
        let raw = self
            .exec(["inspect", "--format", "{{json .State}}", container])
            .await?;
        serde_json::from_str(raw.trim()).map_err(|source| ContainerError::MalformedState {
            container: container.to_owned(),
            source,
        })
    }

    /// Blocks until a container stops and returns its exit code.
    pub async fn wait(&self, container: &str) -> Result<i64, ContainerError> {
        let out = self.exec(["wait", container]).await?;
        out.trim()
            .parse()
            .map_err(|_| ContainerError::Unhealthy {
                container: container.to_owned(),
                reason: format!("unexpected wait output: {}", out.trim()),
            })
    }

    /// Returns the standard output of a container, waiting for it to stop
    /// first. Content on the container's standard error is reported as an
    /// error.
    pub async fn logs(&self, container: &str) -> Result<String, ContainerError> {
        self.wait(container).await?;

        let mut command = Command::new(&self.program);
        command.args(["logs", container]).kill_on_drop(true);
        let rendered = format!("{:?}", command.as_std());

        let output = command
            .output()
            .await
            .map_err(|source| ContainerError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(ContainerError::ErrorLogs {
                container: container.to_owned(),
                stderr: stderr.trim().to_owned(),
            });
        }
        debug!("successfully read logs from container {container}");

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Force-removes a single container.
    pub async fn remove_container(&self, container: &str) -> Result<(), ContainerError> {
        self.exec(["rm", "--force", "--volumes", container]).await?;
        Ok(())
    }

    /// Force-removes every container of an instance, returning the first
    /// error encountered.
    pub async fn remove_instance(&self, instance: &AppInstance) -> Result<(), ContainerError> {
        let removals = instance
            .containers()
            .map(|(_, container)| self.remove_container(container));

        future::join_all(removals)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn push_health_flags(args: &mut Vec<String>, healthcheck: &Healthcheck) {
    if let Some(test) = &healthcheck.test {
        let probe = match test.split_first() {
            Some((kind, rest)) if kind == "CMD" || kind == "CMD-SHELL" => rest.join(" "),
            _ => test.join(" "),
        };
        if !probe.is_empty() {
            args.push("--health-cmd".into());
            args.push(probe);
        }
    }
    if let Some(interval) = healthcheck.interval {
        args.push("--health-interval".into());
        args.push(format!("{}ms", interval.as_millis()));
    }
    if let Some(retries) = healthcheck.retries {
        args.push("--health-retries".into());
        args.push(retries.to_string());
    }
    if let Some(start_period) = healthcheck.start_period {
        args.push("--health-start-period".into());
        args.push(format!("{}ms", start_period.as_millis()));
    }
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
    #[serde(rename = "Health", default)]
    health: Option<HealthState>,
}

#[derive(Debug, Deserialize)]
struct HealthState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "FailingStreak", default)]
    failing_streak: u32,
    #[serde(rename = "Log", default)]
    log: Vec<HealthLogEntry>,
}

#[derive(Debug, Deserialize)]
struct HealthLogEntry {
    #[serde(rename = "Output", default)]
    output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_state_payloads_parse() {
        let state: ContainerState = serde_json::from_str(
            r#"{"Status": "running", "ExitCode": 0, "Health": {"Status": "starting", "FailingStreak": 1, "Log": [{"Output": "connection refused"}]}}"#,
        )
        .unwrap();
        assert_eq!(state.status, "running");
        let health = state.health.unwrap();
        assert_eq!(health.failing_streak, 1);
        assert_eq!(health.log[0].output, "connection refused");

        let state: ContainerState =
            serde_json::from_str(r#"{"Status": "exited", "ExitCode": 137, "Health": null}"#)
                .unwrap();
        assert_eq!(state.exit_code, 137);
        assert!(state.health.is_none());
    }

    #[test]
    fn health_flags_follow_compose_forms() {
        let healthcheck = Healthcheck {
            test: Some(
                ["CMD", "curl", "-f", "http://localhost"]
                    .map(str::to_owned)
                    .to_vec(),
            ),
            interval: Some(Duration::from_secs(2)),
            retries: Some(5),
            start_period: Some(Duration::from_millis(1500)),
        };

        let mut args = Vec::new();
        push_health_flags(&mut args, &healthcheck);
        assert_eq!(
            args,
            [
                "--health-cmd",
                "curl -f http://localhost",
                "--health-interval",
                "2000ms",
                "--health-retries",
                "5",
                "--health-start-period",
                "1500ms",
            ]
        );
    }
}
