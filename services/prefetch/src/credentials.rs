//! Registry credential resolution.
//!
//! The prefetcher only depends on the [`CredentialResolver`] contract: given a
//! registry host, produce a [`Credential`] or fail. [`DockerConfigKeychain`]
//! is the resolver shipped with the binary and reads the static `auths`
//! entries of a Docker `config.json`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use prefetch_reference::DEFAULT_REGISTRY;

/// Authentication material for one registry host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password.
    Basic { username: String, password: String },
    /// OAuth refresh token the daemon exchanges for registry access.
    IdentityToken(String),
    /// No credentials; the registry is accessed anonymously.
    Anonymous,
}

impl Credential {
    /// Create a basic credential.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns true if this is the anonymous marker.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

// Passwords never reach logs through Debug.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Errors from credential resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid docker config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("credentials for {registry} are unusable: {reason}")]
    InvalidEntry {
        registry: String,
        reason: &'static str,
    },

    #[error("no credentials found for {0} and anonymous access is disabled")]
    NotFound(String),
}

/// Maps a registry host to credentials.
///
/// Called once per pull; implementations must not assume results are cached
/// by the caller.
pub trait CredentialResolver: Send + Sync {
    /// Resolve credentials for the given registry host (e.g. `ghcr.io`).
    fn resolve(&self, registry: &str) -> Result<Credential, ResolveError>;
}

/// Docker config.json structure (only the parts used here).
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    /// Base64-encoded "username:password".
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "identitytoken")]
    identity_token: Option<String>,
}

/// Resolver backed by the `auths` section of a Docker `config.json`.
///
/// The file is re-read on every call, so edits made while pulls are running
/// apply to the next pull.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    path: Option<PathBuf>,
    allow_anonymous: bool,
}

impl DockerConfigKeychain {
    /// Keychain reading the given config file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            allow_anonymous: true,
        }
    }

    /// Keychain reading `$DOCKER_CONFIG/config.json`, falling back to
    /// `~/.docker/config.json`.
    pub fn from_docker_config_dir(docker_config: Option<&Path>) -> Self {
        let path = match docker_config {
            Some(dir) => Some(dir.join("config.json")),
            None => BaseDirs::new().map(|dirs| dirs.home_dir().join(".docker").join("config.json")),
        };
        Self {
            path,
            allow_anonymous: true,
        }
    }

    /// Whether a registry without an entry resolves to [`Credential::Anonymous`]
    /// (the default) or fails with [`ResolveError::NotFound`].
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Path of the config file, if one could be determined.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn load(&self) -> Result<DockerConfigFile, ResolveError> {
        let Some(path) = &self.path else {
            return Ok(DockerConfigFile::default());
        };

        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Docker config not found");
                return Ok(DockerConfigFile::default());
            }
            Err(source) => {
                return Err(ResolveError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&contents).map_err(|source| ResolveError::Malformed {
            path: path.clone(),
            source,
        })
    }
}

impl CredentialResolver for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Result<Credential, ResolveError> {
        let config = self.load()?;
        let wanted = normalize_registry(registry);

        let entry = config
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry);

        match entry {
            Some(entry) => {
                debug!(registry = %wanted, "Using credentials from docker config");
                decode_entry(&wanted, entry)
            }
            None if self.allow_anonymous => {
                debug!(registry = %wanted, "No credentials configured, pulling anonymously");
                Ok(Credential::Anonymous)
            }
            None => Err(ResolveError::NotFound(wanted)),
        }
    }
}

fn decode_entry(registry: &str, entry: &DockerAuthEntry) -> Result<Credential, ResolveError> {
    let invalid = |reason| ResolveError::InvalidEntry {
        registry: registry.to_string(),
        reason,
    };

    // A stored token supersedes the `auth` field written alongside it.
    if let Some(token) = entry.identity_token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Credential::IdentityToken(token.to_string()));
    }

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Credential::basic(username, password));
    }

    if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .map_err(|_| invalid("auth is not valid base64"))?;
        let decoded = String::from_utf8(decoded).map_err(|_| invalid("auth is not valid UTF-8"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| invalid("auth is not of the form username:password"))?;
        return Ok(Credential::basic(username, password));
    }

    Err(invalid("entry has no auth, username/password, or identity token"))
}

/// Normalize a registry key from config.json or a reference to a bare host.
fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);

    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}
