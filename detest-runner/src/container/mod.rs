// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Container plumbing: app definitions read from Docker Compose files, and a
//! client that drives the Docker CLI.
//!
//! This is the boundary the core consumes; everything above it only sees
//! [`AppDefinition`], [`AppInstance`] and [`Client`].

mod app;
mod client;

pub use app::{AppDefinition, AppInstance, BuildSpec, Healthcheck, ServiceDefinition};
pub use client::{Client, RunOptions};
