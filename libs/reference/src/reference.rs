//! Image reference type and parser.

use std::fmt;
use std::str::FromStr;

use crate::ReferenceError;

/// Registry assumed when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag assumed when a reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;
const MAX_PORT_LENGTH: usize = 5;

/// A parsed image reference.
///
/// Examples:
/// - `alpine` -> (index.docker.io, library/alpine, tag latest)
/// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, tag v1)
/// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, digest)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A ':' only separates a tag when it follows the last '/', otherwise
        // it belongs to a registry port.
        let last_slash = remainder.rfind('/');
        let (name, tag) = match remainder.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &remainder[colon + 1..];
                validate_tag(tag)?;
                (&remainder[..colon], Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        if name.is_empty() {
            return Err(ReferenceError::InvalidRepository(String::new()));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(ReferenceError::NameTooLong {
                length: name.len(),
                limit: MAX_NAME_LENGTH,
            });
        }

        let (registry, repository) = split_registry(name);
        validate_registry(&registry)?;
        validate_repository(&repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host, including the port if one was given.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Explicit tag, if the reference carried one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if the reference carried one.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Fully qualified name without tag or digest (`registry/repository`).
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The identifier a registry resolves: the digest when present, else the
    /// tag, else `latest`.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.tag, &self.digest) {
            (Some(tag), Some(digest)) => write!(f, ":{tag}@{digest}"),
            (None, Some(digest)) => write!(f, "@{digest}"),
            (Some(tag), None) => write!(f, ":{tag}"),
            (None, None) => write!(f, ":{DEFAULT_TAG}"),
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split a name into registry and repository, applying Docker Hub defaults.
fn split_registry(name: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.bytes().any(|b| b.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let registry = if registry == "docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    };

    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        (registry, format!("library/{repository}"))
    } else {
        (registry, repository)
    }
}

fn validate_registry(registry: &str) -> Result<(), ReferenceError> {
    let invalid = || ReferenceError::InvalidRegistry(registry.to_string());

    let (host, port) = if let Some(bracketed) = registry.strip_prefix('[') {
        // IPv6 literal: [addr] or [addr]:port
        let (addr, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
        if addr.is_empty() || !addr.bytes().all(|b| b.is_ascii_hexdigit() || b == b':') {
            return Err(invalid());
        }
        let port = match rest {
            "" => None,
            _ => Some(rest.strip_prefix(':').ok_or_else(invalid)?),
        };
        (None, port)
    } else {
        match registry.rsplit_once(':') {
            Some((host, port)) => (Some(host), Some(port)),
            None => (Some(registry), None),
        }
    };

    if let Some(port) = port {
        if port.is_empty()
            || port.len() > MAX_PORT_LENGTH
            || !port.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
    }

    if let Some(host) = host {
        let valid_label = |label: &str| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        };
        if !host.split('.').all(valid_label) {
            return Err(invalid());
        }
    }

    Ok(())
}

fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    if repository.split('/').all(valid_path_component) {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRepository(repository.to_string()))
    }
}

/// Matches `[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*`.
fn valid_path_component(component: &str) -> bool {
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = component.as_bytes();

    if bytes.is_empty() || !is_alnum(bytes[0]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        match bytes[i] {
            b'.' => i += 1,
            b'_' => {
                i += 1;
                if bytes.get(i) == Some(&b'_') {
                    i += 1;
                }
            }
            b'-' => {
                while bytes.get(i) == Some(&b'-') {
                    i += 1;
                }
            }
            _ => return false,
        }
        // Every separator must be followed by an alphanumeric.
        match bytes.get(i) {
            Some(&b) if is_alnum(b) => {}
            _ => return false,
        }
    }

    true
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = tag.as_bytes();

    let valid = !bytes.is_empty()
        && bytes.len() <= MAX_TAG_LENGTH
        && is_word(bytes[0])
        && bytes[1..]
            .iter()
            .all(|&b| is_word(b) || b == b'.' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

fn validate_digest(digest: &str) -> Result<(), ReferenceError> {
    let invalid = |reason| ReferenceError::InvalidDigest {
        digest: digest.to_string(),
        reason,
    };

    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| invalid("missing algorithm separator"))?;

    let valid_algorithm = algorithm.split(['.', '+', '_', '-']).all(|part| {
        !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    });
    if !valid_algorithm {
        return Err(invalid("invalid algorithm"));
    }

    if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(invalid("encoded part must be lowercase hexadecimal"));
    }

    match algorithm {
        "sha256" if hex.len() != 64 => Err(invalid("sha256 digest must be 64 hex characters")),
        "sha512" if hex.len() != 128 => Err(invalid("sha512 digest must be 128 hex characters")),
        _ if hex.len() < 32 => Err(invalid("encoded part must be at least 32 hex characters")),
        _ => Ok(()),
    }
}
