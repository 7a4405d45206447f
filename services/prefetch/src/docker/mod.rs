//! Docker Engine API runtime.
//!
//! - `auth`: the `X-Registry-Auth` envelope
//! - `client`: pull requests over the daemon's Unix socket

mod auth;
mod client;

pub use auth::{AuthEnvelope, REGISTRY_AUTH_HEADER};
pub use client::{DockerClient, DockerHostError, DEFAULT_DOCKER_HOST};
