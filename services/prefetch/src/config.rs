//! Configuration for the prefetch binary.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Which progress events make it into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Status changes only; byte-level transfer ticks are skipped.
    Quiet,
    /// Every event, including transfer ticks.
    Verbose,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Prefetch configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Docker daemon address (`unix://` only).
    pub docker_host: Option<String>,

    /// Docker Engine API version to pin requests to.
    pub docker_api_version: Option<String>,

    /// Directory containing the Docker `config.json`.
    pub docker_config: Option<PathBuf>,

    /// Fail pulls for registries without configured credentials instead of
    /// pulling anonymously.
    pub require_auth: bool,

    pub progress: ProgressMode,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Images to prefetch in addition to those given on the command line.
    pub images: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let require_auth = match non_empty("PREFETCH_REQUIRE_AUTH").as_deref() {
            None | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => bail!("invalid PREFETCH_REQUIRE_AUTH '{other}': expected true or false"),
        };

        let progress = match non_empty("PREFETCH_PROGRESS").as_deref() {
            None | Some("quiet") => ProgressMode::Quiet,
            Some("verbose") => ProgressMode::Verbose,
            Some(other) => bail!("invalid PREFETCH_PROGRESS '{other}': expected quiet or verbose"),
        };

        let log_format = match non_empty("PREFETCH_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("invalid PREFETCH_LOG_FORMAT '{other}': expected text or json"),
        };

        let images = non_empty("PREFETCH_IMAGES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|image| !image.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            docker_host: non_empty("DOCKER_HOST"),
            docker_api_version: non_empty("DOCKER_API_VERSION"),
            docker_config: non_empty("DOCKER_CONFIG").map(PathBuf::from),
            require_auth,
            progress,
            log_level: non_empty("PREFETCH_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            images,
        })
    }
}
