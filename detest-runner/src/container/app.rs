// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The services declared in a Docker Compose definition file.

use crate::errors::AppDefinitionError;
use camino::Utf8Path;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use std::{fs, time::Duration};

/// A collection of services loaded from a Docker Compose definition file,
/// keyed by service name.
#[derive(Clone, Debug, Default)]
pub struct AppDefinition {
    services: IndexMap<String, ServiceDefinition>,
}

impl AppDefinition {
    /// Loads an app definition from a Docker Compose file.
    pub fn load(path: &Utf8Path) -> Result<Self, AppDefinitionError> {
        let contents = fs::read_to_string(path).map_err(AppDefinitionError::Read)?;
        let compose: ComposeFile =
            serde_yaml::from_str(&contents).map_err(AppDefinitionError::Parse)?;

        Ok(Self {
            services: compose.services,
        })
    }

    /// Returns true if the definition declares no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The names of the declared services.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Iterates over the declared services.
    pub fn services(&self) -> impl Iterator<Item = (&str, &ServiceDefinition)> {
        self.services
            .iter()
            .map(|(name, service)| (name.as_str(), service))
    }

    /// Builds a definition from explicit services. Used by the test-suite
    /// adapters, which run a single ad-hoc container.
    pub fn from_services<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = (S, ServiceDefinition)>,
        S: Into<String>,
    {
        Self {
            services: services
                .into_iter()
                .map(|(name, service)| (name.into(), service))
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: IndexMap<String, ServiceDefinition>,
}

/// One service of an app definition. Field names follow the compose
/// schema's snake_case keys.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServiceDefinition {
    /// The image to run. When absent, the image is expected to be built
    /// from [`ServiceDefinition::build`].
    #[serde(default)]
    pub image: Option<String>,

    /// Build instructions for services without a prebuilt image.
    #[serde(default, deserialize_with = "build_spec")]
    pub build: Option<BuildSpec>,

    /// The command passed to the container.
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub command: Option<Vec<String>>,

    /// The entrypoint override for the container.
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub entrypoint: Option<Vec<String>>,

    /// Environment variables in `KEY=VALUE` form.
    #[serde(default, deserialize_with = "env_vars")]
    pub environment: Vec<String>,

    /// How the container reports readiness.
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,

    /// The size of `/dev/shm`, verbatim.
    #[serde(default)]
    pub shm_size: Option<String>,
}

impl ServiceDefinition {
    /// The image this service runs as: the declared image, or the name
    /// derived from its build context.
    pub fn image_name(&self, service: &str) -> Option<String> {
        if let Some(image) = &self.image {
            return Some(image.clone());
        }
        self.build.as_ref().map(|build| {
            let basename = Utf8Path::new(&build.context)
                .file_name()
                .unwrap_or(build.context.as_str());
            format!("{basename}-{service}")
        })
    }
}

/// The build section of a service.
#[derive(Clone, Debug)]
pub struct BuildSpec {
    /// The build context directory.
    pub context: String,
    /// The Dockerfile within the context.
    pub dockerfile: String,
}

/// A compose healthcheck.
#[derive(Clone, Debug, Deserialize)]
pub struct Healthcheck {
    /// The probe command, in either the string or the `["CMD", ...]` form.
    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub test: Option<Vec<String>>,

    /// Time between probes.
    #[serde(default, deserialize_with = "opt_compose_duration")]
    pub interval: Option<Duration>,

    /// Consecutive failures needed to report unhealthy.
    #[serde(default)]
    pub retries: Option<u32>,

    /// Grace period before probes start counting.
    #[serde(default, deserialize_with = "opt_compose_duration")]
    pub start_period: Option<Duration>,
}

/// Parses a compose duration string such as `"30s"`, `"1m30s"` or
/// `"500ms"`.
pub(crate) fn parse_compose_duration(value: &str) -> Result<Duration, AppDefinitionError> {
    let invalid = || AppDefinitionError::InvalidDuration {
        value: value.to_owned(),
    };

    let mut total = Duration::ZERO;
    let mut rest = value.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    while !rest.is_empty() {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            ("ms", 2)
        } else if rest.starts_with("us") {
            ("us", 2)
        } else if rest.starts_with("ns") {
            ("ns", 2)
        } else if rest.starts_with('h') {
            ("h", 1)
        } else if rest.starts_with('m') {
            ("m", 1)
        } else if rest.starts_with('s') {
            ("s", 1)
        } else {
            return Err(invalid());
        };
        rest = &rest[len..];

        total += match unit {
            "h" => Duration::from_secs(amount * 3600),
            "m" => Duration::from_secs(amount * 60),
            "s" => Duration::from_secs(amount),
            "ms" => Duration::from_millis(amount),
            "us" => Duration::from_micros(amount),
            _ => Duration::from_nanos(amount),
        };
    }

    Ok(total)
}

fn opt_compose_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|value| parse_compose_duration(&value).map_err(D::Error::custom))
        .transpose()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    fn into_words(self) -> Vec<String> {
        match self {
            // The string form is split on whitespace; quoting is the
            // container runtime's problem, not ours.
            Self::String(s) => s.split_whitespace().map(str::to_owned).collect(),
            Self::List(list) => list,
        }
    }
}

fn opt_string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<StringOrList> = Option::deserialize(deserializer)?;
    Ok(value.map(StringOrList::into_words))
}

fn env_vars<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EnvVars {
        List(Vec<String>),
        Map(IndexMap<String, Option<serde_yaml::Value>>),
    }

    fn scalar(value: serde_yaml::Value) -> String {
        match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_owned(),
        }
    }

    match EnvVars::deserialize(deserializer)? {
        EnvVars::List(list) => Ok(list),
        EnvVars::Map(map) => Ok(map
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}={}", scalar(value)),
                None => key,
            })
            .collect()),
    }
}

fn build_spec<'de, D>(deserializer: D) -> Result<Option<BuildSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawBuild {
        Context(String),
        Spec {
            context: String,
            #[serde(default)]
            dockerfile: Option<String>,
        },
    }

    let value: Option<RawBuild> = Option::deserialize(deserializer)?;
    Ok(value.map(|raw| match raw {
        RawBuild::Context(context) => BuildSpec {
            context,
            dockerfile: "Dockerfile".to_owned(),
        },
        RawBuild::Spec {
            context,
            dockerfile,
        } => BuildSpec {
            context,
            dockerfile: dockerfile.unwrap_or_else(|| "Dockerfile".to_owned()),
        },
    }))
}

/// The running containers of an app, keyed by service name.
#[derive(Clone, Debug, Default)]
pub struct AppInstance {
    containers: IndexMap<String, String>,
}

impl AppInstance {
    pub(crate) fn insert(&mut self, service: String, container: String) {
        self.containers.insert(service, container);
    }

    /// Returns true if the instance has no running containers.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// The container associated with a service, if any.
    pub fn container(&self, service: &str) -> Option<&str> {
        self.containers.get(service).map(String::as_str)
    }

    /// Iterates over `(service, container)` pairs.
    pub fn containers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.containers
            .iter()
            .map(|(service, container)| (service.as_str(), container.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_compose_services() {
        let contents = indoc! {r#"
            services:
              web:
                image: example/web:1.4
                command: serve --port 8080
                environment:
                  - DB_HOST=db
                  - DEBUG=1
                healthcheck:
                  test: ["CMD", "curl", "-f", "http://localhost:8080"]
                  interval: 1m30s
                  retries: 3
                  start_period: 500ms
              db:
                build:
                  context: ./db
                environment:
                  POSTGRES_PASSWORD: hunter2
                  POSTGRES_DB: app
        "#};

        let compose: ComposeFile = serde_yaml::from_str(contents).unwrap();
        let web = &compose.services["web"];
        assert_eq!(web.image.as_deref(), Some("example/web:1.4"));
        assert_eq!(
            web.command,
            Some(vec!["serve".to_owned(), "--port".to_owned(), "8080".to_owned()])
        );
        assert_eq!(web.environment, vec!["DB_HOST=db", "DEBUG=1"]);

        let health = web.healthcheck.as_ref().unwrap();
        assert_eq!(
            health.test,
            Some(
                ["CMD", "curl", "-f", "http://localhost:8080"]
                    .map(str::to_owned)
                    .to_vec()
            )
        );
        assert_eq!(health.interval, Some(Duration::from_secs(90)));
        assert_eq!(health.retries, Some(3));
        assert_eq!(health.start_period, Some(Duration::from_millis(500)));

        let db = &compose.services["db"];
        assert_eq!(db.image, None);
        assert_eq!(db.build.as_ref().unwrap().context, "./db");
        assert_eq!(db.build.as_ref().unwrap().dockerfile, "Dockerfile");
        assert_eq!(
            db.environment,
            vec!["POSTGRES_PASSWORD=hunter2", "POSTGRES_DB=app"]
        );
        assert_eq!(db.image_name("db").as_deref(), Some("db-db"));
    }

    #[test]
    fn rejects_bad_durations() {
        for bad in ["", "12", "s", "10 s", "1x"] {
            parse_compose_duration(bad).unwrap_err();
        }
        assert_eq!(
            parse_compose_duration("1h2m3s").unwrap(),
            Duration::from_secs(3723)
        );
    }
}
