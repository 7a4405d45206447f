//! Docker Engine API client.
//!
//! This module provides an HTTP client for the Docker daemon's Unix socket
//! API. Only image pulls are implemented.
//!
//! Reference: https://docs.docker.com/engine/api/latest/#tag/Image/operation/ImageCreate

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use prefetch_reference::ImageReference;

use super::auth::{AuthEnvelope, REGISTRY_AUTH_HEADER};
use crate::runtime::{ImageRuntime, PullStartError, PullStream};

/// Socket used when `DOCKER_HOST` is unset.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Errors from constructing a Docker client.
#[derive(Debug, Error)]
pub enum DockerHostError {
    #[error("unsupported DOCKER_HOST '{0}': only unix:// sockets are supported")]
    UnsupportedScheme(String),

    #[error("DOCKER_HOST '{0}' has an empty socket path")]
    EmptyPath(String),

    #[error("invalid DOCKER_API_VERSION '{0}'")]
    InvalidApiVersion(String),
}

/// Docker Engine API client for Unix socket communication.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    api_version: Option<String>,
    client: Client<UnixConnector>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

impl DockerClient {
    /// Create a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            api_version: None,
            client: Client::unix(),
        }
    }

    /// Create a client from a `DOCKER_HOST` value and optional API version,
    /// as the Docker CLI reads them from the environment.
    pub fn from_host(
        docker_host: Option<&str>,
        api_version: Option<&str>,
    ) -> Result<Self, DockerHostError> {
        let host = docker_host.unwrap_or(DEFAULT_DOCKER_HOST);
        let path = host
            .strip_prefix("unix://")
            .ok_or_else(|| DockerHostError::UnsupportedScheme(host.to_string()))?;
        if path.is_empty() {
            return Err(DockerHostError::EmptyPath(host.to_string()));
        }

        let mut client = Self::new(path);
        if let Some(version) = api_version {
            client = client.with_api_version(version)?;
        }
        Ok(client)
    }

    /// Pin requests to an API version such as `1.43`.
    pub fn with_api_version(mut self, version: &str) -> Result<Self, DockerHostError> {
        let version = version.trim_start_matches('v');
        let valid = version
            .split_once('.')
            .is_some_and(|(major, minor)| {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.bytes().all(|b| b.is_ascii_digit())
                    && minor.bytes().all(|b| b.is_ascii_digit())
            });
        if !valid {
            return Err(DockerHostError::InvalidApiVersion(version.to_string()));
        }
        self.api_version = Some(version.to_string());
        Ok(self)
    }

    /// Path of the daemon socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Request path for `POST /images/create`.
    fn pull_path(&self, reference: &ImageReference) -> String {
        // Reference components are restricted to characters that are valid
        // in a query string, so no escaping is needed.
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            reference.name(),
            reference.identifier()
        );
        match &self.api_version {
            Some(version) => format!("/v{version}{path}"),
            None => path,
        }
    }
}

#[async_trait]
impl ImageRuntime for DockerClient {
    async fn pull_image(
        &self,
        reference: &ImageReference,
        auth: &AuthEnvelope,
    ) -> Result<PullStream, PullStartError> {
        let path = self.pull_path(reference);
        let uri: hyper::Uri = Uri::new(&self.socket_path, &path).into();

        debug!(path = %path, "POST request to Docker API");

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(REGISTRY_AUTH_HEADER, auth.as_str())
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if !status.is_success() {
            return Err(daemon_error(status, response.into_body()).await);
        }

        let body = response.into_body();
        let stream = futures_util::stream::unfold(body, |mut body| async move {
            body.data()
                .await
                .map(|chunk| (chunk.map_err(io::Error::other), body))
        });
        Ok(Box::pin(stream))
    }
}

/// Read a failed response into a [`PullStartError`], preferring the
/// daemon's `{"message": ...}` body over the raw text.
async fn daemon_error(status: StatusCode, body: Body) -> PullStartError {
    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => return PullStartError::Http(e),
    };
    let raw = String::from_utf8_lossy(&body).to_string();
    let message = serde_json::from_str::<ErrorResponse>(&raw)
        .map(|e| e.message)
        .unwrap_or(raw);
    debug!(status = %status, message = %message, "Docker API error");
    PullStartError::Daemon {
        status: status.as_u16(),
        message,
    }
}
