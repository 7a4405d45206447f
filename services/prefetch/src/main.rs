//! image-prefetch
//!
//! Pulls the given images into the local Docker daemon in parallel and exits
//! once every pull has finished. A failed pull is logged and does not change
//! the exit status; invalid configuration does.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prefetch_agent::config::{Config, LogFormat, ProgressMode};
use prefetch_agent::docker::DockerClient;
use prefetch_agent::{DockerConfigKeychain, EveryEvent, Prefetcher, ProgressLog, SkipTransferTicks};

/// Prefetch container images into the local Docker daemon.
#[derive(Debug, Parser)]
#[command(name = "image-prefetch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image references to pull (also read from PREFETCH_IMAGES).
    images: Vec<String>,

    /// Docker daemon socket, e.g. unix:///var/run/docker.sock.
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }

    let docker_host = cli.docker_host.as_deref().or(config.docker_host.as_deref());
    let runtime = DockerClient::from_host(docker_host, config.docker_api_version.as_deref())
        .context("Failed to create Docker client")?;
    if !runtime.socket_exists() {
        warn!(
            socket = %runtime.socket_path().display(),
            "Docker socket not found, pulls will fail"
        );
    }

    let keychain = DockerConfigKeychain::from_docker_config_dir(config.docker_config.as_deref())
        .allow_anonymous(!config.require_auth);
    info!(
        socket = %runtime.socket_path().display(),
        docker_config = ?keychain.path(),
        "Configuration loaded"
    );

    let progress_log: Arc<dyn ProgressLog> = match config.progress {
        ProgressMode::Quiet => Arc::new(SkipTransferTicks),
        ProgressMode::Verbose => Arc::new(EveryEvent),
    };

    let prefetcher = Prefetcher::new(
        Arc::new(runtime),
        Arc::new(keychain),
        tokio::runtime::Handle::current(),
    )
    .with_progress_log(progress_log);

    let images: Vec<String> = cli.images.into_iter().chain(config.images).collect();
    if images.is_empty() {
        warn!("No images to prefetch");
        return Ok(());
    }

    for image in images {
        prefetcher.submit(image);
    }
    prefetcher.join().await;

    info!("Prefetch complete");
    Ok(())
}
