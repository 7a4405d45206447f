//! Registry auth envelope sent with a Docker pull request.

use base64::Engine;
use serde::Serialize;

use crate::credentials::Credential;

/// Header the Docker Engine API reads registry credentials from.
pub const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

#[derive(Default, Serialize)]
struct AuthConfig<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    username: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    password: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    identitytoken: &'a str,
}

/// A credential encoded the way the daemon expects it: JSON, then URL-safe
/// base64 with padding.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthEnvelope(String);

impl AuthEnvelope {
    /// Encode a resolved credential. Anonymous encodes as `{}`.
    pub fn encode(credential: &Credential) -> Result<Self, serde_json::Error> {
        let config = match credential {
            Credential::Basic { username, password } => AuthConfig {
                username,
                password,
                ..AuthConfig::default()
            },
            Credential::IdentityToken(identitytoken) => AuthConfig {
                identitytoken,
                ..AuthConfig::default()
            },
            Credential::Anonymous => AuthConfig::default(),
        };
        let json = serde_json::to_vec(&config)?;
        Ok(Self(base64::engine::general_purpose::URL_SAFE.encode(json)))
    }

    /// The encoded header value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthEnvelope(<redacted>)")
    }
}
