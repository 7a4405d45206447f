//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the one daemon operation the prefetcher
//! needs: starting an image pull and handing back its progress stream.
//!
//! A mock implementation is provided for testing and development.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use thiserror::Error;
use tracing::info;

use prefetch_reference::ImageReference;

use crate::docker::AuthEnvelope;

/// Raw progress stream returned by a pull, consumed at most once.
pub type PullStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Errors raised while starting a pull.
#[derive(Debug, Error)]
pub enum PullStartError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("daemon error {status}: {message}")]
    Daemon { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

/// Container runtime interface.
///
/// Implementations are shared by every pull task and must be safe for
/// concurrent use without external locking.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Start pulling an image, returning the daemon's progress stream.
    async fn pull_image(
        &self,
        reference: &ImageReference,
        auth: &AuthEnvelope,
    ) -> Result<PullStream, PullStartError>;
}

/// Mock runtime for testing and development.
///
/// Every pull replays the same scripted frames.
pub struct MockRuntime {
    frames: Vec<Bytes>,
    fail_starts: bool,
    calls: AtomicUsize,
    pulled: Mutex<Vec<(String, String)>>,
}

impl MockRuntime {
    /// Create a mock runtime that replays the given frames.
    pub fn new<I, B>(frames: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            fail_starts: false,
            calls: AtomicUsize::new(0),
            pulled: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock runtime that refuses all pulls.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new(Vec::<Bytes>::new())
        }
    }

    /// Number of times `pull_image` was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// References passed to `pull_image`, in invocation order.
    pub fn pulled(&self) -> Vec<String> {
        self.pulled
            .lock()
            .map(|pulled| pulled.iter().map(|(image, _)| image.clone()).collect())
            .unwrap_or_default()
    }

    /// `X-Registry-Auth` values passed to `pull_image`, in invocation order.
    pub fn auth_headers(&self) -> Vec<String> {
        self.pulled
            .lock()
            .map(|pulled| pulled.iter().map(|(_, auth)| auth.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new([Bytes::from_static(b"{\"status\":\"Pull complete\"}\n")])
    }
}

#[async_trait]
impl ImageRuntime for MockRuntime {
    async fn pull_image(
        &self,
        reference: &ImageReference,
        auth: &AuthEnvelope,
    ) -> Result<PullStream, PullStartError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut pulled) = self.pulled.lock() {
            pulled.push((reference.to_string(), auth.as_str().to_string()));
        }

        if self.fail_starts {
            return Err(PullStartError::Other(
                "Mock runtime configured to fail".to_string(),
            ));
        }

        info!(image = %reference, "[MOCK] Pulling image");

        let frames: Vec<io::Result<Bytes>> = self.frames.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(frames)))
    }
}
